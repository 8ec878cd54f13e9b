//! XDR encoding (RFC 4506) of the NFSv4 types the state layer owns.
//!
//! <https://datatracker.ietf.org/doc/html/rfc4506>
//!
//! The message codec encodes whole COMPOUNDs; this module only covers what
//! stateids, session ids, channel attributes and client owners are made of:
//! 32 and 64 bit unsigned integers, enums, fixed and variable length opaque
//! data and `unsigned int<>` arrays. Every item is big endian and padded to
//! four bytes.

use std::io::{Read, Write};

use byteorder::BigEndian;
use byteorder::{ReadBytesExt, WriteBytesExt};
use num_traits::{FromPrimitive, ToPrimitive};

pub mod nfs4;
mod utils;

/// XDR assumes big endian encoding.
pub type XDREndian = BigEndian;

/// A value that can be written in XDR form.
pub trait Serialize {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()>;
}

/// A value that can be read back from XDR form, in place.
pub trait Deserialize {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()>;
}

/// Reads a `T` starting from its default value.
pub fn deserialize<T>(src: &mut impl Read) -> std::io::Result<T>
where
    T: Deserialize + Default,
{
    let mut val = T::default();
    val.deserialize(src)?;
    Ok(val)
}

/// Marker for enums written as their `i32` discriminant.
pub trait SerializeEnum: ToPrimitive {}

impl<T: SerializeEnum> Serialize for T {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        let val = self.to_i32().ok_or_else(|| utils::invalid_data("Invalid enum value"))?;
        dest.write_i32::<XDREndian>(val)
    }
}

/// Marker for enums read from their `i32` discriminant. Unknown values are
/// rejected.
pub trait DeserializeEnum: FromPrimitive {}

impl<T: DeserializeEnum> Deserialize for T {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let val = src.read_i32::<XDREndian>()?;
        *self = T::from_i32(val).ok_or_else(|| utils::invalid_data("Invalid enum value"))?;
        Ok(())
    }
}

/// `unsigned int`: seqids, slot ids, channel attributes.
impl Serialize for u32 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u32::<XDREndian>(*self)
    }
}

impl Deserialize for u32 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_u32::<XDREndian>()?;
        Ok(())
    }
}

/// `unsigned hyper`: client ids.
impl Serialize for u64 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u64::<XDREndian>(*self)
    }
}

impl Deserialize for u64 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_u64::<XDREndian>()?;
        Ok(())
    }
}

/// `opaque x[N]`: stateid `other`, session ids, verifiers.
impl<const N: usize> Serialize for [u8; N] {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_all(self)?;
        utils::write_padding(N, dest)
    }
}

impl<const N: usize> Deserialize for [u8; N] {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        src.read_exact(self)?;
        utils::read_padding(N, src)
    }
}

/// `opaque x<>`: owner ids.
impl Serialize for [u8] {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        utils::write_len(self.len(), dest)?;
        dest.write_all(self)?;
        utils::write_padding(self.len(), dest)
    }
}

impl Serialize for Vec<u8> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.as_slice().serialize(dest)
    }
}

impl Deserialize for Vec<u8> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let length = utils::read_len(src)?;
        self.resize(length, 0);
        src.read_exact(self)?;
        utils::read_padding(length, src)
    }
}

/// `unsigned int x<>`, as used by `ca_rdma_ird<1>`.
impl Serialize for Vec<u32> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        utils::write_len(self.len(), dest)?;
        self.iter().try_for_each(|i| i.serialize(dest))
    }
}

impl Deserialize for Vec<u32> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let length = utils::read_len(src)?;
        *self = (0..length).map(|_| deserialize::<u32>(src)).collect::<Result<_, _>>()?;
        Ok(())
    }
}

/// Implements [`Serialize`] for a struct by writing its fields in order.
#[allow(non_camel_case_types)]
#[macro_export]
macro_rules! SerializeStruct {
    (
        $t:ident,
        $($element:ident),*
    ) => {
        impl Serialize for $t {
            fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
                $(self.$element.serialize(dest)?;)*
                Ok(())
            }
        }
    };
}

/// Implements [`Deserialize`] for a struct by reading its fields in order.
#[allow(non_camel_case_types)]
#[macro_export]
macro_rules! DeserializeStruct {
    (
        $t:ident,
        $($element:ident),*
    ) => {
        impl Deserialize for $t {
            fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
                $(self.$element.deserialize(src)?;)*
                Ok(())
            }
        }
    };
}

pub use crate::DeserializeStruct;
pub use crate::SerializeStruct;

//! Android resource chunk model shared by binary XML and `resources.arsc`.
//!
//! Every chunk starts with a [`ResChunkHeader`]. Fixed-layout headers are
//! declared with `record!`, which derives their little-endian [`Wire`]
//! encoding from the field list.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

/// Little-endian encoding of a fixed-layout value.
pub trait Wire: Sized {
    fn read(r: &mut impl Read) -> Result<Self>;
    fn write(&self, w: &mut impl Write) -> Result<()>;
}

impl Wire for u8 {
    fn read(r: &mut impl Read) -> Result<Self> {
        Ok(r.read_u8()?)
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        Ok(w.write_u8(*self)?)
    }
}

macro_rules! wire_int {
    ($($ty:ty: $read:ident / $write:ident),* $(,)?) => {$(
        impl Wire for $ty {
            fn read(r: &mut impl Read) -> Result<Self> {
                Ok(r.$read::<LittleEndian>()?)
            }

            fn write(&self, w: &mut impl Write) -> Result<()> {
                Ok(w.$write::<LittleEndian>(*self)?)
            }
        }
    )*};
}

wire_int! {
    u16: read_u16 / write_u16,
    u32: read_u32 / write_u32,
    i32: read_i32 / write_i32,
}

/// Declares a struct whose wire form is its fields in declaration order.
macro_rules! record {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $($(#[$field_meta:meta])* $field:ident: $ty:ty,)*
        }
    ) => {
        $(#[$meta])*
        pub struct $name {
            $($(#[$field_meta])* pub $field: $ty,)*
        }

        impl Wire for $name {
            fn read(r: &mut impl Read) -> Result<Self> {
                Ok(Self {
                    $($field: <$ty as Wire>::read(r)?,)*
                })
            }

            fn write(&self, w: &mut impl Write) -> Result<()> {
                $(self.$field.write(w)?;)*
                Ok(())
            }
        }
    };
}

fn read_vec<T: Wire>(r: &mut impl Read, count: usize) -> Result<Vec<T>> {
    (0..count).map(|_| T::read(r)).collect()
}

fn write_slice<T: Wire>(w: &mut impl Write, items: &[T]) -> Result<()> {
    items.iter().try_for_each(|item| item.write(w))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ChunkType {
    Null = 0x0000,
    StringPool = 0x0001,
    Table = 0x0002,
    Xml = 0x0003,
    XmlStartNamespace = 0x0100,
    XmlEndNamespace = 0x0101,
    XmlStartElement = 0x0102,
    XmlEndElement = 0x0103,
    XmlCdata = 0x0104,
    XmlResourceMap = 0x0180,
    TablePackage = 0x0200,
    TableType = 0x0201,
    TableTypeSpec = 0x0202,
    TableLibrary = 0x0203,
}

impl ChunkType {
    const ALL: [ChunkType; 14] = [
        ChunkType::Null,
        ChunkType::StringPool,
        ChunkType::Table,
        ChunkType::Xml,
        ChunkType::XmlStartNamespace,
        ChunkType::XmlEndNamespace,
        ChunkType::XmlStartElement,
        ChunkType::XmlEndElement,
        ChunkType::XmlCdata,
        ChunkType::XmlResourceMap,
        ChunkType::TablePackage,
        ChunkType::TableType,
        ChunkType::TableTypeSpec,
        ChunkType::TableLibrary,
    ];
}

impl TryFrom<u16> for ChunkType {
    type Error = Error;

    fn try_from(ty: u16) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|known| *known as u16 == ty)
            .ok_or_else(|| Error::encoding(format!("unrecognized chunk type {ty:#06x}")))
    }
}

record! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ResChunkHeader {
        /// A [`ChunkType`] value.
        ty: u16,
        /// Bytes from the chunk start to its payload.
        header_size: u16,
        /// Header plus payload, child chunks included.
        size: u32,
    }
}

impl ResChunkHeader {
    pub const SIZE: u16 = 8;
}

record! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ResStringPoolHeader {
        string_count: u32,
        style_count: u32,
        flags: u32,
        strings_start: u32,
        styles_start: u32,
    }
}

impl ResStringPoolHeader {
    pub const UTF8_FLAG: u32 = 1 << 8;
    /// Chunk header plus the five counters.
    const CHUNK_HEADER_SIZE: u32 = ResChunkHeader::SIZE as u32 + 20;

    pub fn is_utf8(&self) -> bool {
        self.flags & Self::UTF8_FLAG != 0
    }
}

record! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ResTableHeader {
        package_count: u32,
    }
}

record! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ResXmlNodeHeader {
        line_number: u32,
        /// String index of the node comment, -1 for none.
        comment: i32,
    }
}

impl ResXmlNodeHeader {
    pub fn new(line_number: u32) -> Self {
        Self {
            line_number,
            comment: -1,
        }
    }
}

impl Default for ResXmlNodeHeader {
    fn default() -> Self {
        Self::new(1)
    }
}

record! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ResXmlNamespace {
        prefix: i32,
        uri: i32,
    }
}

record! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ResXmlStartElement {
        namespace: i32,
        name: i32,
        /// Offset of the first attribute from the start of this struct.
        attribute_start: u16,
        /// Stride between attributes.
        attribute_size: u16,
        attribute_count: u16,
        /// 1-based index of the `id` attribute, 0 if absent.
        id_index: u16,
        class_index: u16,
        style_index: u16,
    }
}

impl ResXmlStartElement {
    const SIZE: u16 = 20;
}

impl Default for ResXmlStartElement {
    fn default() -> Self {
        Self {
            namespace: -1,
            name: -1,
            attribute_start: Self::SIZE,
            attribute_size: ResXmlAttribute::SIZE,
            attribute_count: 0,
            id_index: 0,
            class_index: 0,
            style_index: 0,
        }
    }
}

record! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ResXmlAttribute {
        namespace: i32,
        name: i32,
        /// String index of the original text, -1 when only typed.
        raw_value: i32,
        typed_value: ResValue,
    }
}

impl ResXmlAttribute {
    const SIZE: u16 = 20;
}

record! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ResXmlEndElement {
        namespace: i32,
        name: i32,
    }
}

record! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ResXmlCdata {
        data: i32,
        typed_value: ResValue,
    }
}

/// A `0xPPTTEEEE` resource id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResTableRef(u32);

impl ResTableRef {
    pub fn new(package: u8, ty: u8, entry: u16) -> Self {
        Self((u32::from(package) << 24) | (u32::from(ty) << 16) | u32::from(entry))
    }
}

impl From<ResTableRef> for u32 {
    fn from(r: ResTableRef) -> u32 {
        r.0
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResTablePackageHeader {
    pub id: u32,
    pub name: String,
    /// Offset of the type string pool from the package start.
    pub type_strings: u32,
    pub last_public_type: u32,
    /// Offset of the key string pool from the package start.
    pub key_strings: u32,
    pub last_public_key: u32,
    pub type_id_offset: u32,
}

impl ResTablePackageHeader {
    /// The name field is a fixed, zero-padded UTF-16 array.
    pub const NAME_UNITS: usize = 128;
    const CHUNK_HEADER_SIZE: u32 = ResChunkHeader::SIZE as u32 + 4 + 2 * 128 + 20;
}

impl Wire for ResTablePackageHeader {
    fn read(r: &mut impl Read) -> Result<Self> {
        let id = u32::read(r)?;
        let units: Vec<u16> = read_vec(r, Self::NAME_UNITS)?;
        let len = units.iter().position(|c| *c == 0).unwrap_or(units.len());
        let name = String::from_utf16(&units[..len])
            .map_err(|err| Error::encoding(format!("package name: {err}")))?;
        Ok(Self {
            id,
            name,
            type_strings: u32::read(r)?,
            last_public_type: u32::read(r)?,
            key_strings: u32::read(r)?,
            last_public_key: u32::read(r)?,
            type_id_offset: u32::read(r)?,
        })
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        let mut units = self.name.encode_utf16().collect::<Vec<_>>();
        if units.len() >= Self::NAME_UNITS {
            return Err(Error::encoding(format!(
                "package name `{}` exceeds {} UTF-16 units",
                self.name,
                Self::NAME_UNITS - 1
            )));
        }
        units.resize(Self::NAME_UNITS, 0);
        self.id.write(w)?;
        write_slice(w, &units)?;
        write_slice(
            w,
            &[
                self.type_strings,
                self.last_public_type,
                self.key_strings,
                self.last_public_key,
                self.type_id_offset,
            ],
        )
    }
}

record! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ResTableTypeSpecHeader {
        /// 1-based type id.
        id: u8,
        res0: u8,
        res1: u16,
        entry_count: u32,
    }
}

record! {
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct ResTableTypeHeader {
        id: u8,
        res0: u8,
        res1: u16,
        entry_count: u32,
        /// Offset of the entry data from the chunk start.
        entries_start: u32,
        config: ResTableConfig,
    }
}

impl ResTableTypeHeader {
    fn chunk_header_size(&self) -> u32 {
        ResChunkHeader::SIZE as u32 + 12 + self.config.size
    }
}

/// A resource configuration. Only the leading fields are named; the rest
/// are carried as raw bytes so any `size` survives a rewrite.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResTableConfig {
    pub size: u32,
    pub imsi: u32,
    pub locale: u32,
    pub screen_type: u32,
    pub input: u32,
    pub screen_size: u32,
    pub version: u32,
    pub extra: Vec<u8>,
}

impl ResTableConfig {
    const NAMED_SIZE: u32 = 28;
}

impl Default for ResTableConfig {
    /// The "any" configuration in its 64 byte form.
    fn default() -> Self {
        Self {
            size: 64,
            imsi: 0,
            locale: 0,
            screen_type: 0,
            input: 0,
            screen_size: 0,
            version: 0,
            extra: vec![0; 64 - Self::NAMED_SIZE as usize],
        }
    }
}

impl Wire for ResTableConfig {
    fn read(r: &mut impl Read) -> Result<Self> {
        let size = u32::read(r)?;
        let extra_len = size
            .checked_sub(Self::NAMED_SIZE)
            .ok_or_else(|| Error::encoding(format!("config size {size} below 28")))?;
        let mut config = Self {
            size,
            imsi: u32::read(r)?,
            locale: u32::read(r)?,
            screen_type: u32::read(r)?,
            input: u32::read(r)?,
            screen_size: u32::read(r)?,
            version: u32::read(r)?,
            extra: vec![0; extra_len as usize],
        };
        r.read_exact(&mut config.extra)?;
        Ok(config)
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        write_slice(
            w,
            &[
                self.size,
                self.imsi,
                self.locale,
                self.screen_type,
                self.input,
                self.screen_size,
                self.version,
            ],
        )?;
        Ok(w.write_all(&self.extra)?)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResTableEntry {
    pub size: u16,
    pub flags: u16,
    pub key: u32,
    pub value: ResValue,
}

impl ResTableEntry {
    pub const FLAG_COMPLEX: u16 = 0x1;
    /// Entry header plus its simple value.
    pub const ENCODED_SIZE: u32 = 16;

    pub fn simple(key: u32, value: ResValue) -> Self {
        Self {
            size: 8,
            flags: 0,
            key,
            value,
        }
    }
}

impl Wire for ResTableEntry {
    fn read(r: &mut impl Read) -> Result<Self> {
        let size = u16::read(r)?;
        let flags = u16::read(r)?;
        if flags & Self::FLAG_COMPLEX != 0 {
            return Err(Error::encoding("complex table entries are not supported"));
        }
        Ok(Self {
            size,
            flags,
            key: u32::read(r)?,
            value: ResValue::read(r)?,
        })
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        self.size.write(w)?;
        self.flags.write(w)?;
        self.key.write(w)?;
        self.value.write(w)
    }
}

record! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ResValue {
        size: u16,
        res0: u8,
        /// A [`ResValueType`] value.
        data_type: u8,
        data: u32,
    }
}

impl ResValue {
    pub fn new(data_type: ResValueType, data: u32) -> Self {
        Self {
            size: 8,
            res0: 0,
            data_type: data_type as u8,
            data,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ResValueType {
    Null = 0x00,
    Reference = 0x01,
    Attribute = 0x02,
    String = 0x03,
    Float = 0x04,
    Dimension = 0x05,
    Fraction = 0x06,
    IntDec = 0x10,
    IntHex = 0x11,
    IntBoolean = 0x12,
}

/// Format mask of an attribute definition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ResAttributeType {
    Any = 0x0000_ffff,
    Reference = 1 << 0,
    String = 1 << 1,
    Integer = 1 << 2,
    Boolean = 1 << 3,
    Color = 1 << 4,
    Float = 1 << 5,
    Dimension = 1 << 6,
    Fraction = 1 << 7,
    Enum = 1 << 16,
    Flags = 1 << 17,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Chunk {
    Null,
    StringPool(Vec<String>),
    Table(ResTableHeader, Vec<Chunk>),
    Xml(Vec<Chunk>),
    XmlStartNamespace(ResXmlNodeHeader, ResXmlNamespace),
    XmlEndNamespace(ResXmlNodeHeader, ResXmlNamespace),
    XmlStartElement(ResXmlNodeHeader, ResXmlStartElement, Vec<ResXmlAttribute>),
    XmlEndElement(ResXmlNodeHeader, ResXmlEndElement),
    XmlCdata(ResXmlNodeHeader, ResXmlCdata),
    XmlResourceMap(Vec<u32>),
    TablePackage(ResTablePackageHeader, Vec<Chunk>),
    TableType(ResTableTypeHeader, Vec<Option<ResTableEntry>>),
    TableTypeSpec(ResTableTypeSpecHeader, Vec<u32>),
    /// A recognised chunk this crate skips, such as a library table.
    Unknown,
}

/// Writes one chunk: a placeholder header, the fields written by `header`,
/// then `body`, and finally the real header with both sizes filled in.
fn emit<W: Seek + Write>(
    w: &mut W,
    ty: ChunkType,
    header: impl FnOnce(&mut W) -> Result<()>,
    body: impl FnOnce(&mut W) -> Result<()>,
) -> Result<()> {
    let start = w.stream_position()?;
    ResChunkHeader::default().write(w)?;
    header(w)?;
    let payload = w.stream_position()?;
    body(w)?;
    let end = w.stream_position()?;

    let header = ResChunkHeader {
        ty: ty as u16,
        header_size: u16::try_from(payload - start)
            .map_err(|_| Error::encoding("chunk header exceeds 64 KiB"))?,
        size: u32::try_from(end - start).map_err(|_| Error::encoding("chunk exceeds 4 GiB"))?,
    };
    w.seek(SeekFrom::Start(start))?;
    header.write(w)?;
    w.seek(SeekFrom::Start(end))?;
    Ok(())
}

fn count_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::encoding(format!("too many {what}")))
}

/// Pool string lengths take one byte, or two with the high bit set on the
/// first.
fn write_utf8_len(out: &mut Vec<u8>, len: usize) -> Result<()> {
    match len {
        0..=0x7f => out.push(len as u8),
        0x80..=0x7fff => out.extend_from_slice(&[((len >> 8) as u8) | 0x80, len as u8]),
        _ => {
            return Err(Error::encoding(format!(
                "string of length {len} does not fit a string pool"
            )))
        }
    }
    Ok(())
}

fn read_utf8_len(r: &mut impl Read) -> Result<usize> {
    let first = usize::from(r.read_u8()?);
    if first & 0x80 == 0 {
        return Ok(first);
    }
    Ok(((first & 0x7f) << 8) | usize::from(r.read_u8()?))
}

fn read_utf16_len(r: &mut impl Read) -> Result<usize> {
    let first = usize::from(u16::read(r)?);
    if first & 0x8000 == 0 {
        return Ok(first);
    }
    Ok(((first & 0x7fff) << 16) | usize::from(u16::read(r)?))
}

fn write_string_pool<W: Seek + Write>(w: &mut W, strings: &[String]) -> Result<()> {
    let mut data = Vec::new();
    let mut offsets = Vec::with_capacity(strings.len());
    for string in strings {
        offsets.push(count_u32(data.len(), "string pool bytes")?);
        write_utf8_len(&mut data, string.encode_utf16().count())?;
        write_utf8_len(&mut data, string.len())?;
        data.extend_from_slice(string.as_bytes());
        data.push(0);
    }
    data.resize(data.len().next_multiple_of(4), 0);

    let string_count = count_u32(strings.len(), "strings")?;
    let header = ResStringPoolHeader {
        string_count,
        style_count: 0,
        flags: ResStringPoolHeader::UTF8_FLAG,
        strings_start: ResStringPoolHeader::CHUNK_HEADER_SIZE + 4 * string_count,
        styles_start: 0,
    };
    emit(
        w,
        ChunkType::StringPool,
        |w| header.write(w),
        |w| {
            write_slice(w, &offsets)?;
            Ok(w.write_all(&data)?)
        },
    )
}

fn read_string_pool<R: Read + Seek>(r: &mut R, start: u64) -> Result<Vec<String>> {
    let header = ResStringPoolHeader::read(r)?;
    let offsets: Vec<u32> = read_vec(r, header.string_count as usize)?;
    let base = start + u64::from(header.strings_start);
    let invalid = |err: &dyn std::fmt::Display| Error::encoding(format!("string pool: {err}"));
    // Styles are never produced here and are skipped on read.
    offsets
        .into_iter()
        .map(|offset| {
            r.seek(SeekFrom::Start(base + u64::from(offset)))?;
            if header.is_utf8() {
                let _units = read_utf8_len(r)?;
                let mut bytes = vec![0; read_utf8_len(r)?];
                r.read_exact(&mut bytes)?;
                String::from_utf8(bytes).map_err(|err| invalid(&err))
            } else {
                let len = read_utf16_len(r)?;
                let units: Vec<u16> = read_vec(r, len)?;
                String::from_utf16(&units).map_err(|err| invalid(&err))
            }
        })
        .collect()
}

impl Chunk {
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let start = r.stream_position()?;
        let header = ResChunkHeader::read(r)?;
        if header.header_size < ResChunkHeader::SIZE || header.size < u32::from(header.header_size)
        {
            return Err(Error::encoding(format!("malformed chunk {header:?}")));
        }
        let ty = ChunkType::try_from(header.ty)?;
        let payload = start + u64::from(header.header_size);
        let end = start + u64::from(header.size);
        tracing::trace!("{ty:?} chunk at {start}, {} bytes", header.size);

        let chunk = match ty {
            ChunkType::Null => Chunk::Null,
            ChunkType::TableLibrary => Chunk::Unknown,
            ChunkType::StringPool => Chunk::StringPool(read_string_pool(r, start)?),
            ChunkType::Xml => Chunk::Xml(Self::parse_children(r, payload, end)?),
            ChunkType::Table => {
                let table = ResTableHeader::read(r)?;
                Chunk::Table(table, Self::parse_children(r, payload, end)?)
            }
            ChunkType::TablePackage => {
                let package = ResTablePackageHeader::read(r)?;
                Chunk::TablePackage(package, Self::parse_children(r, payload, end)?)
            }
            ChunkType::TableTypeSpec => {
                let spec = ResTableTypeSpecHeader::read(r)?;
                r.seek(SeekFrom::Start(payload))?;
                let masks = read_vec(r, spec.entry_count as usize)?;
                Chunk::TableTypeSpec(spec, masks)
            }
            ChunkType::TableType => Self::parse_type(r, start, payload)?,
            ChunkType::XmlResourceMap => {
                r.seek(SeekFrom::Start(payload))?;
                Chunk::XmlResourceMap(read_vec(r, ((end - payload) / 4) as usize)?)
            }
            node => {
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(payload))?;
                Self::parse_node(r, node, node_header, payload)?
            }
        };
        r.seek(SeekFrom::Start(end))?;
        Ok(chunk)
    }

    fn parse_node<R: Read + Seek>(
        r: &mut R,
        ty: ChunkType,
        node: ResXmlNodeHeader,
        payload: u64,
    ) -> Result<Self> {
        Ok(match ty {
            ChunkType::XmlStartNamespace => Chunk::XmlStartNamespace(node, ResXmlNamespace::read(r)?),
            ChunkType::XmlEndNamespace => Chunk::XmlEndNamespace(node, ResXmlNamespace::read(r)?),
            ChunkType::XmlEndElement => Chunk::XmlEndElement(node, ResXmlEndElement::read(r)?),
            ChunkType::XmlCdata => Chunk::XmlCdata(node, ResXmlCdata::read(r)?),
            ChunkType::XmlStartElement => {
                let element = ResXmlStartElement::read(r)?;
                let first = payload + u64::from(element.attribute_start);
                let attributes = (0..u64::from(element.attribute_count))
                    .map(|i| {
                        r.seek(SeekFrom::Start(first + i * u64::from(element.attribute_size)))?;
                        ResXmlAttribute::read(r)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Chunk::XmlStartElement(node, element, attributes)
            }
            other => return Err(Error::encoding(format!("{other:?} is not an XML node"))),
        })
    }

    fn parse_type<R: Read + Seek>(r: &mut R, start: u64, payload: u64) -> Result<Self> {
        let header = ResTableTypeHeader::read(r)?;
        r.seek(SeekFrom::Start(payload))?;
        let offsets: Vec<u32> = read_vec(r, header.entry_count as usize)?;
        // Entry offsets are relative to entries_start, not the index table.
        let base = start + u64::from(header.entries_start);
        let entries = offsets
            .into_iter()
            .map(|offset| match offset {
                u32::MAX => Ok(None),
                offset => {
                    r.seek(SeekFrom::Start(base + u64::from(offset)))?;
                    ResTableEntry::read(r).map(Some)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Chunk::TableType(header, entries))
    }

    fn parse_children<R: Read + Seek>(r: &mut R, start: u64, end: u64) -> Result<Vec<Chunk>> {
        r.seek(SeekFrom::Start(start))?;
        let mut chunks = vec![];
        while r.stream_position()? < end {
            chunks.push(Chunk::parse(r)?);
        }
        if r.stream_position()? != end {
            return Err(Error::encoding("child chunks overrun their parent"));
        }
        Ok(chunks)
    }

    fn write_children<W: Seek + Write>(w: &mut W, chunks: &[Chunk]) -> Result<()> {
        chunks.iter().try_for_each(|chunk| chunk.write(w))
    }

    pub fn write<W: Seek + Write>(&self, w: &mut W) -> Result<()> {
        match self {
            Chunk::Null | Chunk::Unknown => Ok(()),
            Chunk::StringPool(strings) => write_string_pool(w, strings),
            Chunk::Table(table, chunks) => emit(
                w,
                ChunkType::Table,
                |w| table.write(w),
                |w| Self::write_children(w, chunks),
            ),
            Chunk::Xml(chunks) => emit(w, ChunkType::Xml, |_| Ok(()), |w| {
                Self::write_children(w, chunks)
            }),
            Chunk::XmlStartNamespace(node, namespace) => emit(
                w,
                ChunkType::XmlStartNamespace,
                |w| node.write(w),
                |w| namespace.write(w),
            ),
            Chunk::XmlEndNamespace(node, namespace) => emit(
                w,
                ChunkType::XmlEndNamespace,
                |w| node.write(w),
                |w| namespace.write(w),
            ),
            Chunk::XmlStartElement(node, element, attributes) => {
                let element = ResXmlStartElement {
                    attribute_start: ResXmlStartElement::SIZE,
                    attribute_size: ResXmlAttribute::SIZE,
                    attribute_count: u16::try_from(attributes.len())
                        .map_err(|_| Error::encoding("too many attributes"))?,
                    ..*element
                };
                emit(
                    w,
                    ChunkType::XmlStartElement,
                    |w| node.write(w),
                    |w| {
                        element.write(w)?;
                        write_slice(w, attributes)
                    },
                )
            }
            Chunk::XmlEndElement(node, element) => emit(
                w,
                ChunkType::XmlEndElement,
                |w| node.write(w),
                |w| element.write(w),
            ),
            Chunk::XmlCdata(node, cdata) => emit(
                w,
                ChunkType::XmlCdata,
                |w| node.write(w),
                |w| cdata.write(w),
            ),
            Chunk::XmlResourceMap(ids) => emit(w, ChunkType::XmlResourceMap, |_| Ok(()), |w| {
                write_slice(w, ids)
            }),
            Chunk::TablePackage(package, chunks) => {
                let [Chunk::StringPool(types), Chunk::StringPool(keys), rest @ ..] =
                    chunks.as_slice()
                else {
                    return Err(Error::encoding(
                        "package must start with type and key string pools",
                    ));
                };
                // The key pool offset depends on the encoded type pool.
                let type_pool = chunks[0].to_bytes()?;
                let package = ResTablePackageHeader {
                    type_strings: ResTablePackageHeader::CHUNK_HEADER_SIZE,
                    last_public_type: count_u32(types.len(), "types")?,
                    key_strings: ResTablePackageHeader::CHUNK_HEADER_SIZE
                        + count_u32(type_pool.len(), "type pool bytes")?,
                    last_public_key: count_u32(keys.len(), "keys")?,
                    ..package.clone()
                };
                emit(
                    w,
                    ChunkType::TablePackage,
                    |w| package.write(w),
                    |w| {
                        w.write_all(&type_pool)?;
                        chunks[1].write(w)?;
                        Self::write_children(w, rest)
                    },
                )
            }
            Chunk::TableType(header, entries) => {
                let entry_count = count_u32(entries.len(), "entries")?;
                let header = ResTableTypeHeader {
                    entry_count,
                    entries_start: header.chunk_header_size() + 4 * entry_count,
                    ..header.clone()
                };
                let mut next = 0;
                let offsets = entries
                    .iter()
                    .map(|entry| match entry {
                        Some(_) => {
                            let offset = next;
                            next += ResTableEntry::ENCODED_SIZE;
                            offset
                        }
                        None => u32::MAX,
                    })
                    .collect::<Vec<_>>();
                emit(
                    w,
                    ChunkType::TableType,
                    |w| header.write(w),
                    |w| {
                        write_slice(w, &offsets)?;
                        entries.iter().flatten().try_for_each(|entry| entry.write(w))
                    },
                )
            }
            Chunk::TableTypeSpec(spec, masks) => {
                let spec = ResTableTypeSpecHeader {
                    entry_count: count_u32(masks.len(), "type spec entries")?,
                    ..*spec
                };
                emit(
                    w,
                    ChunkType::TableTypeSpec,
                    |w| spec.write(w),
                    |w| write_slice(w, masks),
                )
            }
        }
    }

    /// Encodes the chunk into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Parses a buffer that must hold exactly one top-level chunk.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let chunk = Self::parse(&mut cursor)?;
        if cursor.position() != bytes.len() as u64 {
            return Err(Error::encoding(format!(
                "trailing data after chunk: {} of {} bytes consumed",
                cursor.position(),
                bytes.len()
            )));
        }
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_at(bytes: &[u8], pos: usize) -> ResChunkHeader {
        ResChunkHeader::read(&mut Cursor::new(&bytes[pos..])).unwrap()
    }

    #[test]
    fn string_pool_sizes_and_long_strings() {
        let long = "x".repeat(300);
        let pool = Chunk::StringPool(vec!["a".into(), "héllo".into(), long.clone()]);
        let bytes = pool.to_bytes().unwrap();
        let header = header_at(&bytes, 0);
        assert_eq!(header.ty, ChunkType::StringPool as u16);
        assert_eq!(header.header_size, 28);
        assert_eq!(header.size as usize, bytes.len());
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(
            Chunk::from_bytes(&bytes).unwrap(),
            Chunk::StringPool(vec!["a".into(), "héllo".into(), long])
        );
    }

    #[test]
    fn oversized_string_is_an_encoding_error() {
        let pool = Chunk::StringPool(vec!["y".repeat(0x8000)]);
        assert!(matches!(pool.to_bytes(), Err(Error::Encoding(_))));
    }

    #[test]
    fn type_chunk_computes_entries_start_and_offsets() {
        let value = ResValue::new(ResValueType::String, 3);
        let chunk = Chunk::TableType(
            ResTableTypeHeader {
                id: 1,
                res0: 0,
                res1: 0,
                entry_count: 0,
                entries_start: 0,
                config: ResTableConfig::default(),
            },
            vec![
                Some(ResTableEntry::simple(0, value)),
                None,
                Some(ResTableEntry::simple(2, value)),
            ],
        );
        let bytes = chunk.to_bytes().unwrap();
        let header = header_at(&bytes, 0);
        assert_eq!(header.header_size, 84);
        assert_eq!(header.size as usize, bytes.len());
        // entry_count, then entries_start right after the three offsets
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 96);
        assert_eq!(&bytes[84..88], &0u32.to_le_bytes());
        assert_eq!(&bytes[88..92], &0xffff_ffffu32.to_le_bytes());
        assert_eq!(&bytes[92..96], &16u32.to_le_bytes());
        match Chunk::from_bytes(&bytes).unwrap() {
            Chunk::TableType(header, entries) => {
                assert_eq!(header.entry_count, 3);
                assert_eq!(entries[1], None);
                assert_eq!(entries[2].unwrap().key, 2);
            }
            other => panic!("unexpected chunk {other:?}"),
        }
    }

    #[test]
    fn package_header_points_at_both_pools() {
        let package = Chunk::TablePackage(
            ResTablePackageHeader {
                id: 0x7f,
                name: "com.example".into(),
                type_strings: 0,
                last_public_type: 0,
                key_strings: 0,
                last_public_key: 0,
                type_id_offset: 0,
            },
            vec![
                Chunk::StringPool(vec!["string".into()]),
                Chunk::StringPool(vec!["app_name".into(), "title".into()]),
            ],
        );
        let bytes = package.to_bytes().unwrap();
        assert_eq!(header_at(&bytes, 0).header_size, 288);
        let Chunk::TablePackage(header, _) = Chunk::from_bytes(&bytes).unwrap() else {
            panic!("expected a package");
        };
        assert_eq!(header.name, "com.example");
        assert_eq!(header.type_strings, 288);
        assert_eq!((header.last_public_type, header.last_public_key), (1, 2));
        let types = header_at(&bytes, header.type_strings as usize);
        assert_eq!(header.key_strings, 288 + types.size);
        assert_eq!(
            header_at(&bytes, header.key_strings as usize).ty,
            ChunkType::StringPool as u16
        );
    }

    #[test]
    fn config_keeps_trailing_bytes() {
        let config = ResTableConfig {
            size: 32,
            version: 21,
            extra: vec![1, 2, 3, 4],
            ..ResTableConfig::default()
        };
        let mut bytes = vec![];
        config.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(ResTableConfig::read(&mut Cursor::new(&bytes)).unwrap(), config);
        assert!(ResTableConfig::read(&mut Cursor::new(&8u32.to_le_bytes())).is_err());
    }

    #[test]
    fn unknown_chunk_type_is_rejected() {
        let bytes = [0x00, 0xff, 0x08, 0x00, 0x08, 0x00, 0x00, 0x00];
        assert!(Chunk::from_bytes(&bytes).is_err());
    }

    #[test]
    fn overlong_package_name_is_rejected() {
        let header = ResTablePackageHeader {
            id: 0x7f,
            name: "p".repeat(128),
            type_strings: 0,
            last_public_type: 0,
            key_strings: 0,
            last_public_key: 0,
            type_id_offset: 0,
        };
        assert!(header.write(&mut Vec::new()).is_err());
    }
}

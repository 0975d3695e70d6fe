//! Minimal single-class Dalvik executable.
//!
//! The image holds the id tables of an empty `MainActivity` extending
//! `android.app.Activity`, without any code items. Every table is laid out
//! back to back after the header, followed by the string data and, at the
//! very end of the file, the map list.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha1::{Digest, Sha1};
use std::io::{Cursor, Read, Write};

pub const DEX_MAGIC: &[u8; 8] = b"dex\n039\0";
pub const HEADER_SIZE: u32 = 0x70;
pub const ENDIAN_CONSTANT: u32 = 0x1234_5678;
pub const MIN_DEX_SIZE: u32 = 4096;
pub const DEFAULT_MAX_DEX_SIZE: u64 = 8 * 1024 * 1024;

const ACC_PUBLIC: u32 = 0x1;

const TYPE_HEADER_ITEM: u16 = 0x0000;
const TYPE_STRING_ID_ITEM: u16 = 0x0001;
const TYPE_TYPE_ID_ITEM: u16 = 0x0002;
const TYPE_PROTO_ID_ITEM: u16 = 0x0003;
const TYPE_METHOD_ID_ITEM: u16 = 0x0005;
const TYPE_CLASS_DEF_ITEM: u16 = 0x0006;
const TYPE_MAP_LIST: u16 = 0x1000;
const TYPE_STRING_DATA_ITEM: u16 = 0x2002;

const MAIN_ACTIVITY: &str = "Lcom/example/app/MainActivity;";
const ACTIVITY: &str = "Landroid/app/Activity;";
const OBJECT: &str = "Ljava/lang/Object;";
const STRING: &str = "Ljava/lang/String;";
const VOID: &str = "V";
const SOURCE_FILE: &str = "MainActivity.java";

const TYPES: &[&str] = &[
    ACTIVITY,
    "Landroid/content/Context;",
    "Landroid/os/Bundle;",
    "Landroid/view/View;",
    MAIN_ACTIVITY,
    OBJECT,
    STRING,
    VOID,
];

/// (shorty, return type)
const PROTOS: &[(&str, &str)] = &[("V", VOID), ("L", STRING)];

/// (class, name, shorty)
const METHODS: &[(&str, &str, &str)] = &[
    (ACTIVITY, "<init>", "V"),
    (ACTIVITY, "onCreate", "V"),
    (MAIN_ACTIVITY, "<init>", "V"),
    (MAIN_ACTIVITY, "onCreate", "V"),
    (MAIN_ACTIVITY, "onClick", "V"),
    (OBJECT, "<init>", "V"),
    (OBJECT, "toString", "L"),
];

/// (count, offset) pair of one id table.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Section {
    pub size: u32,
    pub off: u32,
}

impl Section {
    fn read(r: &mut impl Read) -> Result<Self> {
        let size = r.read_u32::<LittleEndian>()?;
        let off = r.read_u32::<LittleEndian>()?;
        Ok(Self { size, off })
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.size)?;
        w.write_u32::<LittleEndian>(self.off)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DexHeader {
    pub checksum: u32,
    pub signature: [u8; 20],
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub link: Section,
    pub map_off: u32,
    pub string_ids: Section,
    pub type_ids: Section,
    pub proto_ids: Section,
    pub field_ids: Section,
    pub method_ids: Section,
    pub class_defs: Section,
    pub data: Section,
}

impl DexHeader {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let mut magic = [0; 8];
        r.read_exact(&mut magic)?;
        if &magic != DEX_MAGIC {
            return Err(Error::encoding("not a dex file"));
        }
        let checksum = r.read_u32::<LittleEndian>()?;
        let mut signature = [0; 20];
        r.read_exact(&mut signature)?;
        let file_size = r.read_u32::<LittleEndian>()?;
        let header_size = r.read_u32::<LittleEndian>()?;
        let endian_tag = r.read_u32::<LittleEndian>()?;
        let link = Section::read(r)?;
        let map_off = r.read_u32::<LittleEndian>()?;
        let string_ids = Section::read(r)?;
        let type_ids = Section::read(r)?;
        let proto_ids = Section::read(r)?;
        let field_ids = Section::read(r)?;
        let method_ids = Section::read(r)?;
        let class_defs = Section::read(r)?;
        let data = Section::read(r)?;
        Ok(Self {
            checksum,
            signature,
            file_size,
            header_size,
            endian_tag,
            link,
            map_off,
            string_ids,
            type_ids,
            proto_ids,
            field_ids,
            method_ids,
            class_defs,
            data,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(DEX_MAGIC)?;
        w.write_u32::<LittleEndian>(self.checksum)?;
        w.write_all(&self.signature)?;
        w.write_u32::<LittleEndian>(self.file_size)?;
        w.write_u32::<LittleEndian>(self.header_size)?;
        w.write_u32::<LittleEndian>(self.endian_tag)?;
        self.link.write(w)?;
        w.write_u32::<LittleEndian>(self.map_off)?;
        self.string_ids.write(w)?;
        self.type_ids.write(w)?;
        self.proto_ids.write(w)?;
        self.field_ids.write(w)?;
        self.method_ids.write(w)?;
        self.class_defs.write(w)?;
        self.data.write(w)?;
        Ok(())
    }
}

/// Largest 4-byte aligned `u32`.
const MAX_ALIGNED: u32 = u32::MAX & !3;

fn align4(n: u32) -> u32 {
    n.checked_add(3).map_or(MAX_ALIGNED, |n| n & !3)
}

fn write_uleb128(w: &mut impl Write, mut value: u32) -> Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            w.write_u8(byte)?;
            return Ok(());
        }
        w.write_u8(byte | 0x80)?;
    }
}

/// Sorted string table with index lookup.
struct StringIds(Vec<&'static str>);

impl StringIds {
    fn new() -> Self {
        let mut strings = TYPES.to_vec();
        strings.extend(PROTOS.iter().map(|(shorty, _)| *shorty));
        strings.extend(METHODS.iter().map(|(_, name, _)| *name));
        strings.push(SOURCE_FILE);
        // Dex requires string ids ordered by contents; all of these are ASCII.
        strings.sort_unstable();
        strings.dedup();
        Self(strings)
    }

    fn id(&self, s: &str) -> Result<u32> {
        self.0
            .iter()
            .position(|v| *v == s)
            .map(|i| i as u32)
            .ok_or_else(|| Error::encoding(format!("`{}` missing from dex strings", s)))
    }
}

/// Id tables resolved to indices, each in the order dex requires.
struct Tables {
    strings: StringIds,
    types: Vec<u32>,
    protos: Vec<(u32, u32)>,
    methods: Vec<(u16, u16, u32)>,
}

impl Tables {
    fn new() -> Result<Self> {
        let strings = StringIds::new();
        let mut types = TYPES
            .iter()
            .map(|ty| strings.id(ty))
            .collect::<Result<Vec<_>>>()?;
        types.sort_unstable();
        let type_id = |ty: &str| -> Result<u32> {
            let string = strings.id(ty)?;
            types
                .iter()
                .position(|v| *v == string)
                .map(|i| i as u32)
                .ok_or_else(|| Error::encoding(format!("`{}` missing from dex types", ty)))
        };

        let mut protos = PROTOS
            .iter()
            .map(|(shorty, ret)| Ok((strings.id(shorty)?, type_id(ret)?)))
            .collect::<Result<Vec<_>>>()?;
        // Protos are ordered by return type.
        protos.sort_unstable_by_key(|(_, ret)| *ret);
        let proto_id = |shorty: &str| -> Result<u16> {
            let shorty = strings.id(shorty)?;
            protos
                .iter()
                .position(|(s, _)| *s == shorty)
                .map(|i| i as u16)
                .ok_or_else(|| Error::encoding("dangling proto"))
        };

        let mut methods = METHODS
            .iter()
            .map(|(class, name, shorty)| {
                Ok((type_id(class)? as u16, proto_id(shorty)?, strings.id(name)?))
            })
            .collect::<Result<Vec<_>>>()?;
        methods.sort_unstable_by_key(|(class, proto, name)| (*class, *name, *proto));

        Ok(Self {
            strings,
            types,
            protos,
            methods,
        })
    }

    fn type_id(&self, ty: &str) -> Result<u32> {
        let string = self.strings.id(ty)?;
        self.types
            .iter()
            .position(|v| *v == string)
            .map(|i| i as u32)
            .ok_or_else(|| Error::encoding(format!("`{}` missing from dex types", ty)))
    }

    fn string_data(&self) -> Result<(Vec<u8>, Vec<u32>)> {
        let mut data = Vec::new();
        let mut offsets = Vec::with_capacity(self.strings.0.len());
        for s in &self.strings.0 {
            offsets.push(data.len() as u32);
            write_uleb128(&mut data, s.encode_utf16().count() as u32)?;
            data.write_all(s.as_bytes())?;
            data.write_u8(0)?;
        }
        Ok((data, offsets))
    }
}

/// Target file size for an input estimated at `estimated_size` bytes.
pub fn dex_file_size(estimated_size: u64, max_size: u64) -> u32 {
    let target = (estimated_size / 4)
        .min(max_size)
        .max(MIN_DEX_SIZE as u64)
        .min(u64::from(MAX_ALIGNED));
    align4(target as u32)
}

pub fn encode_minimal_dex(estimated_size: u64) -> Result<Vec<u8>> {
    encode_dex(estimated_size, DEFAULT_MAX_DEX_SIZE)
}

/// Encodes the minimal dex sized after `estimated_size`. The size is capped
/// at `max_size` but never drops below [`MIN_DEX_SIZE`] or what the tables
/// need.
pub fn encode_dex(estimated_size: u64, max_size: u64) -> Result<Vec<u8>> {
    let tables = Tables::new()?;
    let (string_data, string_offsets) = tables.string_data()?;

    let count = |n: usize| u32::try_from(n).map_err(|_| Error::encoding("dex table too large"));
    let string_ids = Section {
        size: count(tables.strings.0.len())?,
        off: HEADER_SIZE,
    };
    let type_ids = Section {
        size: count(tables.types.len())?,
        off: string_ids.off + 4 * string_ids.size,
    };
    let proto_ids = Section {
        size: count(tables.protos.len())?,
        off: type_ids.off + 4 * type_ids.size,
    };
    let method_ids = Section {
        size: count(tables.methods.len())?,
        off: proto_ids.off + 12 * proto_ids.size,
    };
    let class_defs = Section {
        size: 1,
        off: method_ids.off + 8 * method_ids.size,
    };
    let data = Section {
        size: align4(count(string_data.len())?),
        off: class_defs.off + 32 * class_defs.size,
    };
    let map_entries: [(u16, u32, u32); 8] = [
        (TYPE_HEADER_ITEM, 1, 0),
        (TYPE_STRING_ID_ITEM, string_ids.size, string_ids.off),
        (TYPE_TYPE_ID_ITEM, type_ids.size, type_ids.off),
        (TYPE_PROTO_ID_ITEM, proto_ids.size, proto_ids.off),
        (TYPE_METHOD_ID_ITEM, method_ids.size, method_ids.off),
        (TYPE_CLASS_DEF_ITEM, class_defs.size, class_defs.off),
        (TYPE_STRING_DATA_ITEM, string_ids.size, data.off),
        (TYPE_MAP_LIST, 1, 0),
    ];
    let map_size = 4 + 12 * map_entries.len() as u32;
    let minimum = data.off + data.size + map_size;
    let file_size = dex_file_size(estimated_size, max_size).max(minimum);
    let map_off = file_size - map_size;

    let header = DexHeader {
        checksum: 0,
        signature: [0; 20],
        file_size,
        header_size: HEADER_SIZE,
        endian_tag: ENDIAN_CONSTANT,
        link: Section::default(),
        map_off,
        string_ids,
        type_ids,
        proto_ids,
        field_ids: Section::default(),
        method_ids,
        class_defs,
        data,
    };

    let mut w = Cursor::new(Vec::with_capacity(file_size as usize));
    header.write(&mut w)?;
    for offset in &string_offsets {
        w.write_u32::<LittleEndian>(data.off + offset)?;
    }
    for ty in &tables.types {
        w.write_u32::<LittleEndian>(*ty)?;
    }
    for (shorty, ret) in &tables.protos {
        w.write_u32::<LittleEndian>(*shorty)?;
        w.write_u32::<LittleEndian>(*ret)?;
        w.write_u32::<LittleEndian>(0)?;
    }
    for (class, proto, name) in &tables.methods {
        w.write_u16::<LittleEndian>(*class)?;
        w.write_u16::<LittleEndian>(*proto)?;
        w.write_u32::<LittleEndian>(*name)?;
    }
    w.write_u32::<LittleEndian>(tables.type_id(MAIN_ACTIVITY)?)?;
    w.write_u32::<LittleEndian>(ACC_PUBLIC)?;
    w.write_u32::<LittleEndian>(tables.type_id(ACTIVITY)?)?;
    w.write_u32::<LittleEndian>(0)?; // interfaces_off
    w.write_u32::<LittleEndian>(tables.strings.id(SOURCE_FILE)?)?;
    w.write_u32::<LittleEndian>(0)?; // annotations_off
    w.write_u32::<LittleEndian>(0)?; // class_data_off
    w.write_u32::<LittleEndian>(0)?; // static_values_off
    debug_assert_eq!(w.position(), data.off as u64);
    w.write_all(&string_data)?;

    let mut bytes = w.into_inner();
    bytes.resize(map_off as usize, 0);
    let mut w = Cursor::new(bytes);
    w.set_position(map_off as u64);
    w.write_u32::<LittleEndian>(map_entries.len() as u32)?;
    for (ty, size, off) in map_entries {
        let off = if ty == TYPE_MAP_LIST { map_off } else { off };
        w.write_u16::<LittleEndian>(ty)?;
        w.write_u16::<LittleEndian>(0)?;
        w.write_u32::<LittleEndian>(size)?;
        w.write_u32::<LittleEndian>(off)?;
    }
    let mut bytes = w.into_inner();
    if bytes.len() != file_size as usize {
        return Err(Error::encoding(format!(
            "dex is {} bytes, header says {}",
            bytes.len(),
            file_size
        )));
    }

    // The signature is part of the checksummed range, so it goes first.
    let signature = Sha1::digest(&bytes[32..]);
    bytes[12..32].copy_from_slice(&signature);
    let checksum = adler::adler32_slice(&bytes[12..]);
    bytes[8..12].copy_from_slice(&checksum.to_le_bytes());

    tracing::debug!("encoded dex of {} bytes", bytes.len());
    Ok(bytes)
}

/// Parses the header of `bytes` and checks its size, signature and checksum.
pub fn check_dex(bytes: &[u8]) -> Result<DexHeader> {
    let header = DexHeader::read(&mut Cursor::new(bytes))?;
    if header.file_size as usize != bytes.len() {
        return Err(Error::encoding(format!(
            "dex is {} bytes, header says {}",
            bytes.len(),
            header.file_size
        )));
    }
    if header.header_size != HEADER_SIZE || header.endian_tag != ENDIAN_CONSTANT {
        return Err(Error::encoding("unexpected dex header layout"));
    }
    if Sha1::digest(&bytes[32..]).as_slice() != &header.signature[..] {
        return Err(Error::encoding("dex signature mismatch"));
    }
    if adler::adler32_slice(&bytes[12..]) != header.checksum {
        return Err(Error::encoding("dex checksum mismatch"));
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(bytes: &[u8], pos: u32) -> u32 {
        u32::from_le_bytes(bytes[pos as usize..pos as usize + 4].try_into().unwrap())
    }

    fn u16_at(bytes: &[u8], pos: u32) -> u16 {
        u16::from_le_bytes(bytes[pos as usize..pos as usize + 2].try_into().unwrap())
    }

    #[test]
    fn minimal_dex_has_valid_header() {
        let bytes = encode_minimal_dex(100_000).unwrap();
        assert!(bytes.len() >= 4096);
        assert_eq!(&bytes[..8], DEX_MAGIC);
        let header = check_dex(&bytes).unwrap();
        assert_eq!(header.file_size as usize, bytes.len());
        assert!(header.string_ids.size >= 10);
    }

    #[test]
    fn size_follows_estimate_within_limits() {
        assert_eq!(encode_minimal_dex(0).unwrap().len(), 4096);
        assert_eq!(encode_minimal_dex(400_000).unwrap().len(), 100_000);
        assert_eq!(encode_dex(400_000, 8192).unwrap().len(), 8192);
        // a limit below what the tables need still yields a whole image
        let tiny = encode_dex(0, 0).unwrap();
        assert!(check_dex(&tiny).is_ok());
    }

    #[test]
    fn size_near_u32_max_does_not_overflow() {
        assert_eq!(align4(u32::MAX - 1), MAX_ALIGNED);
        assert_eq!(align4(MAX_ALIGNED), MAX_ALIGNED);
        assert_eq!(dex_file_size(u64::MAX, u64::from(u32::MAX)), MAX_ALIGNED);
        assert_eq!(dex_file_size(u64::MAX, u64::from(u32::MAX - 1)), MAX_ALIGNED);
        assert_eq!(dex_file_size(400_000, u64::from(u32::MAX - 1)), 100_000);
    }

    #[test]
    fn map_list_and_tables_are_consistent() {
        let bytes = encode_minimal_dex(100_000).unwrap();
        let header = check_dex(&bytes).unwrap();

        let map_off = header.map_off;
        assert_eq!(map_off as usize, bytes.len() - 100);
        let entries = u32_at(&bytes, map_off);
        assert_eq!(entries, 8);
        let entry = |i: u32| {
            let pos = map_off + 4 + 12 * i;
            (u16_at(&bytes, pos), u32_at(&bytes, pos + 4), u32_at(&bytes, pos + 8))
        };
        assert_eq!(entry(0), (TYPE_HEADER_ITEM, 1, 0));
        assert_eq!(
            entry(1),
            (TYPE_STRING_ID_ITEM, header.string_ids.size, header.string_ids.off)
        );
        assert_eq!(entry(7), (TYPE_MAP_LIST, 1, map_off));

        assert_eq!(header.string_ids.off, HEADER_SIZE);
        assert_eq!(header.type_ids.off, header.string_ids.off + 4 * header.string_ids.size);
        assert_eq!(header.proto_ids.off, header.type_ids.off + 4 * header.type_ids.size);
        assert_eq!(header.method_ids.off, header.proto_ids.off + 12 * header.proto_ids.size);
        assert_eq!(header.class_defs.off, header.method_ids.off + 8 * header.method_ids.size);
        assert_eq!(header.data.off, header.class_defs.off + 32);

        let strings = header.string_ids.size;
        let types = header.type_ids.size;
        let protos = header.proto_ids.size;
        for i in 0..strings {
            let off = u32_at(&bytes, header.string_ids.off + 4 * i);
            assert!(off >= header.data.off && off < header.data.off + header.data.size);
        }
        for i in 0..types {
            assert!(u32_at(&bytes, header.type_ids.off + 4 * i) < strings);
        }
        for i in 0..protos {
            let pos = header.proto_ids.off + 12 * i;
            assert!(u32_at(&bytes, pos) < strings);
            assert!(u32_at(&bytes, pos + 4) < types);
        }
        for i in 0..header.method_ids.size {
            let pos = header.method_ids.off + 8 * i;
            assert!((u16_at(&bytes, pos) as u32) < types);
            assert!((u16_at(&bytes, pos + 2) as u32) < protos);
            assert!(u32_at(&bytes, pos + 4) < strings);
        }
        let class_def = header.class_defs.off;
        assert!(u32_at(&bytes, class_def) < types);
        assert!(u32_at(&bytes, class_def + 8) < types);
        assert!(u32_at(&bytes, class_def + 16) < strings);
    }

    #[test]
    fn tampering_breaks_the_signature() {
        let mut bytes = encode_minimal_dex(0).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(check_dex(&bytes).is_err());
    }
}

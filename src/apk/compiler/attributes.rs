use crate::apk::compiler::table::StringTable;
use crate::apk::res::{ResAttributeType, ResValue, ResValueType};
use crate::core::config::ANDROID_NAMESPACE;
use crate::error::{Error, Result};
use roxmltree::Attribute;
use std::collections::{BTreeMap, BTreeSet};

/// A framework attribute from `android.R.attr`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AndroidAttribute {
    pub name: &'static str,
    pub id: u32,
    pub ty: ResAttributeType,
}

const fn attr(name: &'static str, id: u32, ty: ResAttributeType) -> AndroidAttribute {
    AndroidAttribute { name, id, ty }
}

/// Attributes the compiler can type. Anything else compiles to a plain string.
const ANDROID_ATTRIBUTES: &[AndroidAttribute] = &[
    attr("theme", 0x0101_0000, ResAttributeType::Reference),
    attr("label", 0x0101_0001, ResAttributeType::String),
    attr("icon", 0x0101_0002, ResAttributeType::Reference),
    attr("name", 0x0101_0003, ResAttributeType::String),
    attr("hasCode", 0x0101_000c, ResAttributeType::Boolean),
    attr("debuggable", 0x0101_000f, ResAttributeType::Boolean),
    attr("exported", 0x0101_0010, ResAttributeType::Boolean),
    attr("value", 0x0101_0024, ResAttributeType::String),
    attr("scheme", 0x0101_0027, ResAttributeType::String),
    attr("host", 0x0101_0028, ResAttributeType::String),
    attr("text", 0x0101_014f, ResAttributeType::String),
    attr("minSdkVersion", 0x0101_020c, ResAttributeType::Integer),
    attr("versionCode", 0x0101_021b, ResAttributeType::Integer),
    attr("versionName", 0x0101_021c, ResAttributeType::String),
    attr("targetSdkVersion", 0x0101_0270, ResAttributeType::Integer),
    attr("maxSdkVersion", 0x0101_0271, ResAttributeType::Integer),
    attr("allowBackup", 0x0101_0280, ResAttributeType::Boolean),
    attr("required", 0x0101_028e, ResAttributeType::Boolean),
    attr("extractNativeLibs", 0x0101_04ea, ResAttributeType::Boolean),
    attr("usesCleartextTraffic", 0x0101_04ec, ResAttributeType::Boolean),
    attr("compileSdkVersion", 0x0101_0572, ResAttributeType::Integer),
    attr("compileSdkVersionCodename", 0x0101_0573, ResAttributeType::String),
];

pub fn android_attribute(name: &str) -> Option<&'static AndroidAttribute> {
    ANDROID_ATTRIBUTES.iter().find(|attr| attr.name == name)
}

fn is_android(attr: &Attribute) -> bool {
    attr.namespace() == Some(ANDROID_NAMESPACE)
}

pub fn compile_attr(
    attr: &AndroidAttribute,
    value: &str,
    strings: &Strings,
    resources: &StringTable,
) -> Result<ResValue> {
    let string_value = || -> Result<ResValue> {
        Ok(ResValue::new(ResValueType::String, strings.id(value)? as u32))
    };
    if let Some(reference) = resources.resolve(value)? {
        return Ok(ResValue::new(ResValueType::Reference, reference.into()));
    }
    match attr.ty {
        ResAttributeType::Integer => match parse_int(value) {
            Some((data, data_type)) => Ok(ResValue::new(data_type, data)),
            // minSdkVersion and friends accept codenames
            None => string_value(),
        },
        ResAttributeType::Boolean => match value {
            "true" => Ok(ResValue::new(ResValueType::IntBoolean, 0xffff_ffff)),
            "false" => Ok(ResValue::new(ResValueType::IntBoolean, 0x0000_0000)),
            v if v.starts_with('@') => string_value(),
            _ => Err(Error::encoding(format!(
                "android:{} expects a boolean, got `{}`",
                attr.name, value
            ))),
        },
        // Only references into the synthesized string table resolve.
        _ => string_value(),
    }
}

fn parse_int(value: &str) -> Option<(u32, ResValueType)> {
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        return u32::from_str_radix(hex, 16)
            .ok()
            .map(|v| (v, ResValueType::IntHex));
    }
    value
        .parse::<i32>()
        .ok()
        .map(|v| (v as u32, ResValueType::IntDec))
}

/// Collects every string of a document. Names of typed framework attributes
/// come first, ordered by resource id, so that they line up with the
/// resource map.
pub struct StringPoolBuilder<'a> {
    attributes: BTreeMap<u32, &'a str>,
    strings: BTreeSet<&'a str>,
}

impl<'a> StringPoolBuilder<'a> {
    pub fn new() -> Self {
        Self {
            attributes: Default::default(),
            strings: Default::default(),
        }
    }

    pub fn add_attribute(&mut self, attr: &Attribute<'a, 'a>) {
        match android_attribute(attr.name()).filter(|_| is_android(attr)) {
            Some(known) => {
                self.attributes.insert(known.id, attr.name());
            }
            None => {
                self.strings.insert(attr.name());
            }
        }
        self.strings.insert(attr.value());
    }

    pub fn add_string(&mut self, s: &'a str) {
        self.strings.insert(s);
    }

    pub fn build(self) -> Strings {
        let mut strings = Vec::with_capacity(self.attributes.len() + self.strings.len());
        let mut map = Vec::with_capacity(self.attributes.len());
        for (id, name) in self.attributes {
            strings.push(name.to_string());
            map.push(id);
        }
        for string in self.strings {
            if !strings.iter().any(|s| s == string) {
                strings.push(string.to_string());
            }
        }
        Strings { strings, map }
    }
}

impl Default for StringPoolBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Strings {
    pub strings: Vec<String>,
    pub map: Vec<u32>,
}

impl Strings {
    pub fn id(&self, s2: &str) -> Result<i32> {
        self.strings
            .iter()
            .position(|s| s == s2)
            .map(|id| id as i32)
            .ok_or_else(|| Error::encoding(format!("`{}` missing from the string pool", s2)))
    }
}

use crate::apk::compiler::attributes::{android_attribute, compile_attr, StringPoolBuilder, Strings};
use crate::apk::compiler::table::StringTable;
use crate::apk::res::{
    Chunk, ResValue, ResValueType, ResXmlAttribute, ResXmlCdata, ResXmlEndElement,
    ResXmlNamespace, ResXmlNodeHeader, ResXmlStartElement,
};
use crate::core::config::ANDROID_NAMESPACE;
use crate::error::{Error, Result};
use roxmltree::{Document, Namespace, Node, NodeType};
use std::collections::BTreeMap;

const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

fn declared_namespaces<'a>(node: Node<'a, 'a>) -> impl Iterator<Item = &'a Namespace<'a>> {
    node.namespaces()
        .into_iter()
        .filter(|ns| ns.uri() != XML_NAMESPACE)
}

fn text_of<'a>(node: Node<'a, 'a>) -> Option<&'a str> {
    node.text()
        .map(str::trim)
        .filter(|_| node.node_type() == NodeType::Text)
        .filter(|text| !text.is_empty())
}

/// Compiles a text XML document into a binary XML chunk. `@string/...`
/// attribute values found in `resources` become resource references.
pub fn compile_xml(xml: &str, resources: &StringTable) -> Result<Chunk> {
    let doc = Document::parse(xml).map_err(|err| Error::encoding(err.to_string()))?;
    let root = doc.root_element();
    let mut builder = StringPoolBuilder::new();
    build_string_pool(root, &mut builder);
    let strings = builder.build();
    let mut chunks = vec![Chunk::Null, Chunk::Null];

    let namespaces = declared_namespaces(root)
        .map(|ns| {
            Ok(ResXmlNamespace {
                prefix: ns.name().map(|ns| strings.id(ns)).transpose()?.unwrap_or(-1),
                uri: strings.id(ns.uri())?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    for ns in &namespaces {
        chunks.push(Chunk::XmlStartNamespace(ResXmlNodeHeader::default(), *ns));
    }
    compile_node(root, &strings, &mut chunks, resources)?;
    for ns in namespaces.iter().rev() {
        chunks.push(Chunk::XmlEndNamespace(ResXmlNodeHeader::default(), *ns));
    }

    chunks[0] = Chunk::StringPool(strings.strings);
    chunks[1] = Chunk::XmlResourceMap(strings.map);
    Ok(Chunk::Xml(chunks))
}

fn build_string_pool<'a>(node: Node<'a, 'a>, builder: &mut StringPoolBuilder<'a>) {
    if let Some(text) = text_of(node) {
        builder.add_string(text);
        return;
    }
    if node.node_type() != NodeType::Element {
        for node in node.children() {
            build_string_pool(node, builder);
        }
        return;
    }
    for ns in declared_namespaces(node) {
        if let Some(prefix) = ns.name() {
            builder.add_string(prefix);
        }
        builder.add_string(ns.uri());
    }
    if let Some(ns) = node.tag_name().namespace() {
        builder.add_string(ns);
    }
    builder.add_string(node.tag_name().name());
    for attr in node.attributes() {
        builder.add_attribute(&attr);
    }
    for node in node.children() {
        build_string_pool(node, builder);
    }
}

fn compile_node(
    node: Node,
    strings: &Strings,
    chunks: &mut Vec<Chunk>,
    resources: &StringTable,
) -> Result<()> {
    if let Some(text) = text_of(node) {
        let data = strings.id(text)?;
        chunks.push(Chunk::XmlCdata(
            ResXmlNodeHeader::default(),
            ResXmlCdata {
                data,
                typed_value: ResValue::new(ResValueType::String, data as u32),
            },
        ));
        return Ok(());
    }
    if node.node_type() != NodeType::Element {
        for node in node.children() {
            compile_node(node, strings, chunks, resources)?;
        }
        return Ok(());
    }

    let mut attrs = BTreeMap::new();
    for attr in node.attributes() {
        let known = android_attribute(attr.name())
            .filter(|_| attr.namespace() == Some(ANDROID_NAMESPACE));
        let value = match known {
            Some(known) => compile_attr(known, attr.value(), strings, resources)?,
            None => ResValue::new(ResValueType::String, strings.id(attr.value())? as u32),
        };
        let raw_value = if value.data_type == ResValueType::String as u8 {
            value.data as i32
        } else {
            -1
        };
        let namespace = attr
            .namespace()
            .map(|ns| strings.id(ns))
            .transpose()?
            .unwrap_or(-1);
        let attr = ResXmlAttribute {
            namespace,
            name: strings.id(attr.name())?,
            raw_value,
            typed_value: value,
        };
        // Attributes are ordered by name index, which orders typed
        // attributes by resource id.
        attrs.insert((attr.name, attr.namespace), attr);
    }
    let attrs = attrs.into_values().collect::<Vec<_>>();

    let mut start_element = ResXmlStartElement {
        namespace: node
            .tag_name()
            .namespace()
            .map(|ns| strings.id(ns))
            .transpose()?
            .unwrap_or(-1),
        name: strings.id(node.tag_name().name())?,
        ..Default::default()
    };
    for (i, attr) in attrs.iter().enumerate() {
        let index = i as u16 + 1;
        match strings.strings.get(attr.name as usize).map(String::as_str) {
            Some("id") => start_element.id_index = index,
            Some("class") => start_element.class_index = index,
            Some("style") => start_element.style_index = index,
            _ => {}
        }
    }
    let end_element = ResXmlEndElement {
        namespace: start_element.namespace,
        name: start_element.name,
    };
    chunks.push(Chunk::XmlStartElement(
        ResXmlNodeHeader::default(),
        start_element,
        attrs,
    ));
    for node in node.children() {
        compile_node(node, strings, chunks, resources)?;
    }
    chunks.push(Chunk::XmlEndElement(
        ResXmlNodeHeader::default(),
        end_element,
    ));
    Ok(())
}

/// Whether `bytes` already hold a complete binary XML document.
pub fn is_binary_xml(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0x03, 0x00])
        && matches!(Chunk::from_bytes(bytes), Ok(Chunk::Xml(chunks)) if !chunks.is_empty())
}

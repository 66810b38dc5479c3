//! Small XML helpers shared by the readers and writers

use roxmltree::Node;

/// Escape text for element content or a double-quoted attribute
pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// First child element with the given local name
pub fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.tag_name().name() == name)
}

/// All child elements with the given local name
pub fn children<'a, 'input>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(move |n| n.tag_name().name() == name)
}

/// Trimmed text of the first child element with the given name
pub fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(|n| n.text()).map(str::trim)
}

pub fn child_i64(node: Node, name: &str) -> Option<i64> {
    child_text(node, name).and_then(|t| t.parse().ok())
}

pub fn child_i32(node: Node, name: &str) -> Option<i32> {
    child_text(node, name).and_then(|t| t.parse().ok())
}

pub fn child_u32(node: Node, name: &str) -> Option<u32> {
    child_text(node, name).and_then(|t| t.parse().ok())
}

pub fn attr_u32(node: Node, name: &str) -> Option<u32> {
    node.attribute(name).and_then(|t| t.parse().ok())
}

pub fn attr_i32(node: Node, name: &str) -> Option<i32> {
    node.attribute(name).and_then(|t| t.parse().ok())
}

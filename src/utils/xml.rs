//! XML helpers for the WebDAV bodies the CalDAV provider builds and parses

use std::collections::{HashMap, VecDeque};

use minidom::Element;

/// Depth-first pass over the subtree below `root`, handing every element with
/// the given name to `sink` in document order. A matching element is not
/// descended into (a nested `<response>` belongs to the inner reply, not to
/// us). The walk stops early when the sink returns `false`.
fn visit_named<'a>(root: &'a Element, name: &str, sink: &mut dyn FnMut(&'a Element) -> bool) {
    // Seeded with the direct children, last first, so the first child pops first
    let mut stack: Vec<&'a Element> = root.children().collect();
    stack.reverse();

    while let Some(el) = stack.pop() {
        if el.name() == name {
            if !sink(el) {
                return;
            }
        } else {
            // Its children go on top of the stack, keeping document order
            let first_child = stack.len();
            stack.extend(el.children());
            stack[first_child..].reverse();
        }
    }
}

/// Every element below `root` carrying the given name, in document order
pub fn find_elems<S: AsRef<str>>(root: &Element, searched_name: S) -> Vec<&Element> {
    let mut found = Vec::new();
    visit_named(root, searched_name.as_ref(), &mut |el| {
        found.push(el);
        true
    });
    found
}

/// The first element with the given name, `root` itself included
pub fn find_elem<S: AsRef<str>>(root: &Element, searched_name: S) -> Option<&Element> {
    let name = searched_name.as_ref();
    if root.name() == name {
        return Some(root);
    }
    let mut found = None;
    visit_named(root, name, &mut |el| {
        found = Some(el);
        false
    });
    found
}

/// Utility to track XML namespace symbol mappings, as used in xmlns attribute
/// declarations
///
/// Includes a default mapping of xmlns:d="DAV:"
pub(crate) struct Namespaces {
    available_syms: VecDeque<char>,
    mapping: HashMap<String, char>,
}

impl Namespaces {
    pub(crate) fn new() -> Self {
        let mut mapping = HashMap::new();
        mapping.insert("DAV:".into(), 'd');

        Self {
            available_syms: "ABCDEFGHIJKLMNOPQRSTUVWXYZabcefghijklmnopqrstuvwxyz" //NOTE the missing 'd'
                .chars()
                .collect(),
            mapping,
        }
    }

    /// Maps the namespace to an unassigned symbol and returns it
    pub(crate) fn add<S: ToString>(&mut self, ns: S) -> char {
        let ns = ns.to_string();
        if let Some(sym) = self.mapping.get(&ns) {
            return *sym;
        }
        let sym = self
            .available_syms
            .pop_back()
            .expect("Ran out of namespace symbols");
        self.mapping.insert(ns, sym);
        sym
    }

    pub(crate) fn decl(&self) -> String {
        let mut s = String::new();
        for (k, v) in &self.mapping {
            s.push(' ');
            s.push_str("xmlns:");
            s.push(*v);
            s.push('=');
            s.push('"');
            s.push_str(k.as_str());
            s.push('"');
        }
        s
    }

    pub(crate) fn sym(&self, ns: &str) -> Option<char> {
        self.mapping.get(ns).cloned()
    }

    pub(crate) fn dav_sym(&self) -> char {
        'd'
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTISTATUS: &str = r#"
        <multistatus xmlns="DAV:">
            <response>
                <href>/remote.php/dav/calendars/john/errands/</href>
                <propstat>
                    <prop><displayname>Errands</displayname></prop>
                </propstat>
            </response>
            <response>
                <href>/remote.php/dav/calendars/john/groceries/</href>
            </response>
        </multistatus>
    "#;

    #[test]
    fn walks_to_nested_elements() {
        let root: Element = MULTISTATUS.parse().unwrap();
        assert_eq!(find_elems(&root, "response").len(), 2);
        assert_eq!(
            find_elem(&root, "displayname").map(|e| e.text()),
            Some("Errands".to_string())
        );
        assert!(find_elem(&root, "getctag").is_none());
    }

    #[test]
    fn first_match_follows_document_order_and_stops_there() {
        let root: Element = MULTISTATUS.parse().unwrap();
        let first = find_elem(&root, "href").unwrap();
        assert!(first.text().ends_with("/errands/"));
        // The full walk still sees both
        assert_eq!(find_elems(&root, "href").len(), 2);
    }

    #[test]
    fn matches_are_not_descended_into() {
        let nested: Element = r#"
            <root xmlns="x">
                <item><item>inner</item></item>
                <item>second</item>
            </root>
        "#
        .parse()
        .unwrap();
        // Only the two top-level items count; the inner one belongs to its parent
        assert_eq!(find_elems(&nested, "item").len(), 2);
    }

    #[test]
    fn namespace_symbols_are_stable() {
        let mut ns = Namespaces::new();
        let c = ns.add("urn:ietf:params:xml:ns:caldav");
        assert_eq!(ns.add("urn:ietf:params:xml:ns:caldav"), c);
        assert_eq!(ns.sym("DAV:"), Some('d'));
        assert!(ns.decl().contains("xmlns:d=\"DAV:\""));
    }
}

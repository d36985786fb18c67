use kuchiki::traits::*;
use kuchiki::{parse_html, NodeRef};

/// The content document being materialized inside the restricted context.
///
/// Cloning is cheap; clones share the same tree.
#[derive(Clone, Debug)]
pub struct ContentDocument {
    root: NodeRef,
}

impl ContentDocument {
    pub fn parse(html: &str) -> Self {
        Self {
            root: parse_html().one(html),
        }
    }

    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    pub fn head(&self) -> Option<NodeRef> {
        self.root
            .select_first("head")
            .ok()
            .map(|head| head.as_node().clone())
    }

    pub fn body(&self) -> Option<NodeRef> {
        self.root
            .select_first("body")
            .ok()
            .map(|body| body.as_node().clone())
    }

    pub fn find_by_id(&self, id: &str) -> Option<NodeRef> {
        self.root
            .descendants()
            .elements()
            .find(|element| element.attributes.borrow().get("id") == Some(id))
            .map(|element| element.as_node().clone())
    }

    pub fn is_in_head(&self, node: &NodeRef) -> bool {
        match self.head() {
            Some(head) => node.ancestors().any(|ancestor| ancestor == head),
            None => false,
        }
    }

    pub fn to_html(&self) -> String {
        self.root.to_string()
    }
}

/// Parse markup written by content as if it appeared inside `<body>`.
///
/// The returned nodes are detached from the scratch tree they were parsed in.
pub fn parse_fragment(markup: &str) -> Vec<NodeRef> {
    let wrapped = format!("<!DOCTYPE html><html><head></head><body>{markup}</body></html>");
    let scratch = parse_html().one(wrapped);
    let Ok(body) = scratch.select_first("body") else {
        return Vec::new();
    };

    let nodes: Vec<NodeRef> = body.as_node().children().collect();
    for node in &nodes {
        node.detach();
    }
    nodes
}

pub fn is_script_element(node: &NodeRef) -> bool {
    node.as_element()
        .map(|element| &*element.name.local == "script")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_keeps_scripts_in_body_context() {
        let nodes = parse_fragment("<script>var a = 1;</script><p>after</p>");
        assert_eq!(nodes.len(), 2);
        assert!(is_script_element(&nodes[0]));
        assert!(nodes.iter().all(|node| node.parent().is_none()));
    }

    #[test]
    fn head_membership_follows_ancestors() {
        let document = ContentDocument::parse(
            "<html><head><script id=\"h\"></script></head><body><script id=\"b\"></script></body></html>",
        );
        let head_script = document.find_by_id("h").unwrap();
        let body_script = document.find_by_id("b").unwrap();
        assert!(document.is_in_head(&head_script));
        assert!(!document.is_in_head(&body_script));
    }
}

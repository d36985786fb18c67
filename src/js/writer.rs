use kuchiki::NodeRef;
use tracing::{debug, warn};

use super::dom::{parse_fragment, ContentDocument};
use super::processor::discover_scripts;
use super::script::DiscoveredScript;

/// Emulates `document.open/write/close` as an insertion-point tracker.
///
/// Output of the running script is buffered and flushed as one fragment when
/// the script ends, directly after the script's marker element. Writes that
/// happen with no script open (timers, post-load handlers) are flushed
/// immediately at the last known insertion point. Nothing that existed before
/// a write is ever removed or replaced.
pub struct DocumentWriter {
    document: ContentDocument,
    script_open: bool,
    insertion_point: Option<NodeRef>,
    pending: String,
    discovered: Vec<DiscoveredScript>,
    parsing_complete: bool,
}

impl DocumentWriter {
    pub fn new(document: ContentDocument) -> Self {
        Self {
            document,
            script_open: false,
            insertion_point: None,
            pending: String::new(),
            discovered: Vec::new(),
            parsing_complete: false,
        }
    }

    pub fn document(&self) -> &ContentDocument {
        &self.document
    }

    pub fn is_parsing_complete(&self) -> bool {
        self.parsing_complete
    }

    /// Open the output stream of a script about to run.
    pub fn begin_script(&mut self, marker: Option<&NodeRef>) {
        if self.script_open {
            self.end_script();
        }
        if let Some(marker) = marker {
            self.insertion_point = Some(marker.clone());
        }
        self.script_open = true;
    }

    /// Close the running script's stream and flush whatever it wrote.
    pub fn end_script(&mut self) {
        self.flush();
        self.script_open = false;
    }

    pub fn write(&mut self, markup: &str) {
        self.pending.push_str(markup);
        if !self.script_open {
            self.flush();
        }
    }

    /// `document.open()` would normally discard the document; here the
    /// stream simply keeps going.
    pub fn open(&mut self) {
        debug!(target: "sandbox::writer", "document.open() ignored; keeping rendered content");
    }

    pub fn close(&mut self) {
        self.flush();
    }

    pub fn finish_parsing(&mut self) {
        self.flush();
        self.parsing_complete = true;
    }

    /// Scripts found in flushed output since the last call.
    pub fn take_discovered(&mut self) -> Vec<DiscoveredScript> {
        std::mem::take(&mut self.discovered)
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let markup = std::mem::take(&mut self.pending);
        let nodes = parse_fragment(&markup);
        for node in &nodes {
            self.insert(node.clone());
        }
        self.discovered.extend(discover_scripts(&nodes));
    }

    fn insert(&mut self, node: NodeRef) {
        match self.insertion_point.as_ref() {
            Some(anchor) if anchor.parent().is_some() => anchor.insert_after(node.clone()),
            Some(_) => {
                warn!(target: "sandbox::writer", "insertion point was detached; appending to body");
                self.append_to_body(node.clone());
            }
            None => self.append_to_body(node.clone()),
        }
        self.insertion_point = Some(node);
    }

    fn append_to_body(&self, node: NodeRef) {
        match self.document.body() {
            Some(body) => body.append(node),
            None => self.document.root().append(node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kuchiki::traits::*;

    fn document() -> ContentDocument {
        ContentDocument::parse(
            "<html><body><div id=\"intro\">intro</div><script id=\"s1\"></script><p id=\"tail\">tail</p></body></html>",
        )
    }

    fn body_ids(document: &ContentDocument) -> Vec<String> {
        document
            .body()
            .unwrap()
            .children()
            .elements()
            .map(|element| {
                element
                    .attributes
                    .borrow()
                    .get("id")
                    .unwrap_or("")
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn output_lands_after_script_marker() {
        let document = document();
        let mut writer = DocumentWriter::new(document.clone());
        let marker = document.find_by_id("s1").unwrap();

        writer.begin_script(Some(&marker));
        writer.write("<span id=\"w1\">");
        writer.write("one</span><span id=\"w2\">two</span>");
        assert!(document.find_by_id("w1").is_none(), "buffered until script ends");
        writer.end_script();

        assert_eq!(body_ids(&document), vec!["intro", "s1", "w1", "w2", "tail"]);
    }

    #[test]
    fn writes_outside_a_script_follow_last_output() {
        let document = document();
        let mut writer = DocumentWriter::new(document.clone());
        let marker = document.find_by_id("s1").unwrap();

        writer.begin_script(Some(&marker));
        writer.write("<b id=\"first\">1</b>");
        writer.end_script();
        writer.finish_parsing();

        writer.write("<b id=\"late\">2</b>");
        assert_eq!(
            body_ids(&document),
            vec!["intro", "s1", "first", "late", "tail"]
        );
    }

    #[test]
    fn writes_before_any_script_append_to_body() {
        let document = document();
        let mut writer = DocumentWriter::new(document.clone());
        writer.open();
        writer.write("<i id=\"orphan\">x</i>");
        let ids = body_ids(&document);
        assert_eq!(ids.first().map(String::as_str), Some("intro"));
        assert_eq!(ids.last().map(String::as_str), Some("orphan"));
    }

    #[test]
    fn written_scripts_are_reported() {
        let document = document();
        let mut writer = DocumentWriter::new(document.clone());
        let marker = document.find_by_id("s1").unwrap();

        writer.begin_script(Some(&marker));
        writer.write("<script src=\"extra.js\"></script>");
        writer.end_script();

        let discovered = writer.take_discovered();
        assert_eq!(discovered.len(), 1);
        assert!(discovered[0].marker.is_some());
        assert!(writer.take_discovered().is_empty());
    }
}

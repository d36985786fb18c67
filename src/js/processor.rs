use kuchiki::traits::*;
use kuchiki::{ElementData, NodeDataRef, NodeRef};
use tracing::debug;

use super::dom::ContentDocument;
use super::phase::RenderPhase;
use super::script::{DiscoveredScript, ScriptSource, ScriptType};

/// A script found while materializing the document, with the phase it
/// belongs to.
#[derive(Debug, Clone)]
pub struct MaterializedScript {
    pub phase: RenderPhase,
    pub script: DiscoveredScript,
}

/// Collect every runnable script of `document` in document order.
pub fn collect_scripts(document: &ContentDocument) -> Vec<MaterializedScript> {
    document
        .root()
        .descendants()
        .elements()
        .filter(|element| &*element.name.local == "script")
        .filter_map(|element| {
            let phase = if document.is_in_head(element.as_node()) {
                RenderPhase::Head
            } else {
                RenderPhase::Body
            };
            describe_script(&element).map(|script| MaterializedScript { phase, script })
        })
        .collect()
}

/// Collect runnable scripts inside freshly written nodes, in document order.
pub fn discover_scripts(nodes: &[NodeRef]) -> Vec<DiscoveredScript> {
    nodes
        .iter()
        .flat_map(|node| node.inclusive_descendants().elements())
        .filter(|element| &*element.name.local == "script")
        .filter_map(|element| describe_script(&element))
        .collect()
}

fn describe_script(script: &NodeDataRef<ElementData>) -> Option<DiscoveredScript> {
    let attributes = script.attributes.borrow();
    let script_type = classify_type(attributes.get("type"), attributes.get("language"));
    if script_type != ScriptType::Classic {
        debug!(target: "sandbox::processor", ?script_type, "skipping non-classic script");
        return None;
    }

    let marker = Some(script.as_node().clone());
    if let Some(src) = attributes
        .get("src")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
    {
        return Some(DiscoveredScript {
            source: ScriptSource::External {
                src: src.to_string(),
            },
            marker,
        });
    }

    drop(attributes);
    let code = script.text_contents();
    if code.trim().is_empty() {
        return None;
    }
    Some(DiscoveredScript {
        source: ScriptSource::Inline { code },
        marker,
    })
}

fn classify_type(script_type: Option<&str>, language: Option<&str>) -> ScriptType {
    match script_type {
        Some(value) => {
            let lowered = value.trim().to_ascii_lowercase();
            match lowered.as_str() {
                "" | "text/javascript" | "application/javascript" | "application/x-javascript" => {
                    ScriptType::Classic
                }
                "text/ecmascript" | "application/ecmascript" | "text/jscript" => {
                    ScriptType::Classic
                }
                "module" | "text/javascript+module" => ScriptType::Module,
                _ => ScriptType::Unknown,
            }
        }
        None => match language.map(|l| l.trim().to_ascii_lowercase()) {
            Some(lang) if !lang.is_empty() && !lang.starts_with("javascript") && lang != "jscript" => {
                ScriptType::Unknown
            }
            _ => ScriptType::Classic,
        },
    }
}

//! Isolation of a single operation and the fragments it reaches.
use std::collections::HashMap;

use apollo_compiler::executable::Fragment;
use apollo_compiler::executable::Operation;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Node;

use crate::error::SignatureError;

/// One operation isolated from its document, together with every fragment it
/// transitively spreads. This is the minimal self-contained input the
/// canonicalizer works on.
pub struct ExtractedOperation<'a> {
    operation: &'a Node<Operation>,
    fragments: Vec<&'a Node<Fragment>>,
}

impl<'a> ExtractedOperation<'a> {
    pub fn operation(&self) -> &'a Node<Operation> {
        self.operation
    }

    /// Reachable fragment definitions, sorted by fragment name.
    pub fn fragments(&self) -> impl Iterator<Item = &'a Node<Fragment>> + '_ {
        self.fragments.iter().copied()
    }
}

/// Isolate the operation selected by `operation_name` along with the fragments
/// reachable from it. Fragments spread from inside other fragments are
/// included; fragments the operation never reaches are not.
pub fn extract<'a>(
    document: &'a ExecutableDocument,
    operation_name: Option<&str>,
) -> Result<ExtractedOperation<'a>, SignatureError> {
    let operation = document
        .operations
        .get(operation_name)
        .map_err(|_| SignatureError::OperationNotFound(operation_name.map(str::to_string)))?;

    let mut seen: HashMap<String, &'a Node<Fragment>> = HashMap::new();
    collect_fragments(&operation.selection_set, document, &mut seen);

    let mut fragments: Vec<_> = seen.into_values().collect();
    fragments.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(ExtractedOperation {
        operation,
        fragments,
    })
}

fn collect_fragments<'a>(
    selection_set: &SelectionSet,
    document: &'a ExecutableDocument,
    seen: &mut HashMap<String, &'a Node<Fragment>>,
) {
    for selection in &selection_set.selections {
        match selection {
            Selection::Field(field) => {
                collect_fragments(&field.selection_set, document, seen);
            }
            Selection::InlineFragment(inline) => {
                collect_fragments(&inline.selection_set, document, seen);
            }
            Selection::FragmentSpread(spread) => {
                if seen.contains_key(spread.fragment_name.as_str()) {
                    continue;
                }
                if let Some(fragment) = document.fragments.get(&spread.fragment_name) {
                    seen.insert(spread.fragment_name.to_string(), fragment);
                    collect_fragments(&fragment.selection_set, document, seen);
                }
            }
        }
    }
}

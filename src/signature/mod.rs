//! Normalized operation signatures.
//!
//! A signature is the canonical string form of an operation's shape. Literal
//! argument values are replaced with fixed placeholders, aliases are dropped,
//! and selections, arguments, directives and variable definitions are sorted
//! into a total order that does not depend on how the client wrote the query.
//! Two structurally identical operations therefore always produce the same
//! signature, which bounds the cardinality of the `query:` metric tag and
//! keeps caller-supplied values out of aggregated telemetry.
use std::fmt;

use apollo_compiler::ast::Argument;
use apollo_compiler::ast::Directive;
use apollo_compiler::ast::DirectiveList;
use apollo_compiler::ast::OperationType;
use apollo_compiler::ast::Value;
use apollo_compiler::ast::VariableDefinition;
use apollo_compiler::executable::Field;
use apollo_compiler::executable::Fragment;
use apollo_compiler::executable::FragmentSpread;
use apollo_compiler::executable::InlineFragment;
use apollo_compiler::executable::Operation;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Node;

use crate::error::SignatureError;
use crate::extract;
use crate::extract::ExtractedOperation;

/// Generate the signature for one operation of `document`.
///
/// This is the convenience entry point wiring [`extract::extract`] to
/// [`canonicalize`].
pub fn operation_signature(
    document: &ExecutableDocument,
    operation_name: Option<&str>,
) -> Result<String, SignatureError> {
    Ok(canonicalize(&extract::extract(document, operation_name)?))
}

/// Render an extracted operation into its canonical string form.
///
/// Pure and deterministic: the output depends only on the shape of the input
/// tree, never on source ordering or literal values. The operation comes
/// first, followed by its reachable fragment definitions sorted by name.
pub fn canonicalize(extracted: &ExtractedOperation) -> String {
    let mut sections = vec![SignatureFormatter::Operation(extracted.operation()).to_string()];
    sections.extend(
        extracted
            .fragments()
            .map(|fragment| SignatureFormatter::Fragment(fragment).to_string()),
    );
    sections.join(" ")
}

/// Render every item, then sort on the rendered text before joining.
fn sorted_rendered(items: impl Iterator<Item = String>, separator: &str) -> String {
    let mut rendered: Vec<String> = items.collect();
    rendered.sort();
    rendered.join(separator)
}

enum SignatureFormatter<'a> {
    Operation(&'a Node<Operation>),
    Fragment(&'a Node<Fragment>),
    SelectionSet(&'a SelectionSet),
    Selection(&'a Selection),
    Argument(&'a Node<Argument>),
    Directive(&'a Node<Directive>),
    VariableDefinition(&'a Node<VariableDefinition>),
}

impl fmt::Display for SignatureFormatter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignatureFormatter::Operation(operation) => format_operation(operation, f),
            SignatureFormatter::Fragment(fragment) => format_fragment(fragment, f),
            SignatureFormatter::SelectionSet(selection_set) => {
                format_selection_set(selection_set, f)
            }
            SignatureFormatter::Selection(selection) => format_selection(selection, f),
            SignatureFormatter::Argument(argument) => format_argument(argument, f),
            SignatureFormatter::Directive(directive) => format_directive(directive, f),
            SignatureFormatter::VariableDefinition(variable) => {
                format_variable_definition(variable, f)
            }
        }
    }
}

fn format_operation(operation: &Node<Operation>, f: &mut fmt::Formatter) -> fmt::Result {
    // Anonymous queries with no directives or variable definitions use the
    // query short form.
    let shorthand = operation.operation_type == OperationType::Query
        && operation.name.is_none()
        && operation.variables.is_empty()
        && operation.directives.is_empty();
    if shorthand {
        return format_selection_set(&operation.selection_set, f);
    }

    f.write_str(operation.operation_type.name())?;

    // The name and the variable list bind together without a space, as in
    // `query Foo($a:Int!)`.
    let mut head = String::new();
    if let Some(name) = &operation.name {
        head.push_str(name.as_str());
    }
    if !operation.variables.is_empty() {
        let variables = sorted_rendered(
            operation
                .variables
                .iter()
                .map(|variable| SignatureFormatter::VariableDefinition(variable).to_string()),
            ",",
        );
        head.push('(');
        head.push_str(&variables);
        head.push(')');
    }
    if !head.is_empty() {
        write!(f, " {head}")?;
    }

    let directives = format_directive_list(&operation.directives);
    if !directives.is_empty() {
        write!(f, " {directives}")?;
    }

    let selections = SignatureFormatter::SelectionSet(&operation.selection_set).to_string();
    if !selections.is_empty() {
        write!(f, " {selections}")?;
    }
    Ok(())
}

fn format_fragment(fragment: &Node<Fragment>, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "fragment {} on {}", fragment.name, fragment.selection_set.ty)?;

    let directives = format_directive_list(&fragment.directives);
    if !directives.is_empty() {
        write!(f, " {directives}")?;
    }

    let selections = SignatureFormatter::SelectionSet(&fragment.selection_set).to_string();
    if !selections.is_empty() {
        write!(f, " {selections}")?;
    }
    Ok(())
}

fn format_selection_set(selection_set: &SelectionSet, f: &mut fmt::Formatter) -> fmt::Result {
    // A field with no sub-selections prints nothing at all; the `{}` token is
    // reserved for redacted object literals.
    if selection_set.selections.is_empty() {
        return Ok(());
    }

    // Plain fields sort before fragment spreads, which sort before inline
    // fragments; within a kind the fully rendered text decides. The two-level
    // key gives a total order independent of source ordering.
    let mut rendered: Vec<(u8, String)> = selection_set
        .selections
        .iter()
        .map(|selection| {
            (
                selection_rank(selection),
                SignatureFormatter::Selection(selection).to_string(),
            )
        })
        .collect();
    rendered.sort();

    f.write_str("{ ")?;
    for (index, (_, selection)) in rendered.iter().enumerate() {
        if index != 0 {
            f.write_str(" ")?;
        }
        f.write_str(selection)?;
    }
    f.write_str(" }")
}

fn selection_rank(selection: &Selection) -> u8 {
    match selection {
        Selection::Field(_) => 0,
        Selection::FragmentSpread(_) => 1,
        Selection::InlineFragment(_) => 2,
    }
}

fn format_selection(selection: &Selection, f: &mut fmt::Formatter) -> fmt::Result {
    match selection {
        Selection::Field(field) => format_field(field, f),
        Selection::FragmentSpread(spread) => format_fragment_spread(spread, f),
        Selection::InlineFragment(inline) => format_inline_fragment(inline, f),
    }
}

fn format_field(field: &Node<Field>, f: &mut fmt::Formatter) -> fmt::Result {
    // The alias is never rendered: the signature identifies the query shape,
    // not the caller's chosen response keys.
    f.write_str(&field.name)?;

    if !field.arguments.is_empty() {
        // Sorted by rendered text, not by name alone; redaction has already
        // happened by the time the sort key is built.
        let arguments = sorted_rendered(
            field
                .arguments
                .iter()
                .map(|argument| SignatureFormatter::Argument(argument).to_string()),
            ",",
        );
        write!(f, "({arguments})")?;
    }

    let directives = format_directive_list(&field.directives);
    if !directives.is_empty() {
        write!(f, " {directives}")?;
    }

    let selections = SignatureFormatter::SelectionSet(&field.selection_set).to_string();
    if !selections.is_empty() {
        write!(f, " {selections}")?;
    }
    Ok(())
}

fn format_fragment_spread(spread: &Node<FragmentSpread>, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "...{}", spread.fragment_name)?;

    let directives = format_directive_list(&spread.directives);
    if !directives.is_empty() {
        write!(f, " {directives}")?;
    }
    Ok(())
}

fn format_inline_fragment(inline: &Node<InlineFragment>, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str("...")?;
    if let Some(type_condition) = &inline.type_condition {
        write!(f, " on {type_condition}")?;
    }

    let directives = format_directive_list(&inline.directives);
    if !directives.is_empty() {
        write!(f, " {directives}")?;
    }

    let selections = SignatureFormatter::SelectionSet(&inline.selection_set).to_string();
    if !selections.is_empty() {
        write!(f, " {selections}")?;
    }
    Ok(())
}

fn format_directive_list(directives: &DirectiveList) -> String {
    sorted_rendered(
        directives
            .iter()
            .map(|directive| SignatureFormatter::Directive(directive).to_string()),
        " ",
    )
}

fn format_directive(directive: &Node<Directive>, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "@{}", directive.name)?;
    if !directive.arguments.is_empty() {
        let arguments = sorted_rendered(
            directive
                .arguments
                .iter()
                .map(|argument| SignatureFormatter::Argument(argument).to_string()),
            ",",
        );
        write!(f, "({arguments})")?;
    }
    Ok(())
}

fn format_argument(argument: &Node<Argument>, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}:", argument.name)?;
    format_value(&argument.value, f)
}

fn format_variable_definition(
    variable: &Node<VariableDefinition>,
    f: &mut fmt::Formatter,
) -> fmt::Result {
    write!(f, "${}:{}", variable.name, variable.ty)?;
    if let Some(default) = &variable.default_value {
        f.write_str(" = ")?;
        format_value(default, f)?;
    }
    Ok(())
}

/// Replace literals that may carry caller data with fixed placeholders.
/// Booleans and enums come from finite domains and stay verbatim, as do
/// variable references, which are structural rather than data-bearing.
fn format_value(value: &Value, f: &mut fmt::Formatter) -> fmt::Result {
    match value {
        Value::Int(_) | Value::Float(_) => f.write_str("0"),
        Value::String(_) => f.write_str("\"\""),
        Value::List(_) => f.write_str("[]"),
        Value::Object(_) => f.write_str("{}"),
        Value::Boolean(value) => write!(f, "{value}"),
        Value::Null => f.write_str("null"),
        Value::Enum(value) => write!(f, "{value}"),
        Value::Variable(name) => write!(f, "${name}"),
    }
}

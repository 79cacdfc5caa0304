//! Check command - compile an expression without touching any store.

use anyhow::{Result, bail};
use cohort_abac::compile;

use crate::style::colors::SemanticStyle;
use crate::style::{print_caret, print_error, print_labeled, print_success};

pub fn run(expression: &str) -> Result<()> {
    match compile(expression) {
        Ok(compiled) => {
            print_success("Expression compiles");
            print_labeled("Canonical", &compiled.to_string().code());
            let attributes: Vec<&str> = compiled.attributes().into_iter().collect();
            print_labeled("Attributes", &attributes.join(", "));
            Ok(())
        }
        Err(e) => {
            print_error(&format!("{} at position {}", e.kind, e.position));
            print_caret(expression, e.position);
            bail!("{}", e.message)
        }
    }
}

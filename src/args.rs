//! Argument resolution table
//!
//! Maps each argument a filter declares to the text supplied on the command
//! line, enforces presence and uniqueness, and holds the resolved values
//! (scalars and buffers) for the call vector.

use std::collections::BTreeMap;

use crate::buffer::Buffer;
use crate::error::{Result, RunGenError};
use crate::filter::{ArgSlot, ArgumentKind, ArgumentMetadata, FilterMetadata};
use crate::scalar::ScalarValue;

/// Resolved value of an argument.
#[derive(Debug, Clone)]
pub enum ArgValue {
    Unresolved,
    Scalar(ScalarValue),
    Buffer(Buffer),
}

/// One declared filter argument and what the user supplied for it.
#[derive(Debug, Clone)]
pub struct Argument {
    pub metadata: ArgumentMetadata,
    /// Text value; empty if not supplied.
    pub raw: String,
    /// Whether `raw` came from the command line rather than a default.
    pub explicit: bool,
    pub value: ArgValue,
}

impl Argument {
    fn new(metadata: ArgumentMetadata) -> Self {
        // Handles can only ever be null, so they may be omitted.
        let raw = if metadata.type_tag.is_handle() {
            "nullptr".to_string()
        } else {
            String::new()
        };
        Self {
            metadata,
            raw,
            explicit: false,
            value: ArgValue::Unresolved,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_specified(&self) -> bool {
        !self.raw.is_empty()
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        match &self.value {
            ArgValue::Buffer(b) => Some(b),
            _ => None,
        }
    }
}

/// All arguments of one filter, in declaration order, with a name index.
#[derive(Debug)]
pub struct ArgumentTable {
    arguments: Vec<Argument>,
    by_name: BTreeMap<String, usize>,
    unknown: Vec<String>,
}

impl ArgumentTable {
    /// Build an empty table from a filter's metadata.
    ///
    /// # Errors
    ///
    /// Returns `RunGenError::InvalidMetadata` if two arguments share a name.
    pub fn new(metadata: &FilterMetadata) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        let mut arguments = Vec::with_capacity(metadata.arguments.len());
        for (index, arg) in metadata.arguments.iter().enumerate() {
            if by_name.insert(arg.name.clone(), index).is_some() {
                return Err(RunGenError::InvalidMetadata(format!(
                    "argument name \"{}\" is declared more than once",
                    arg.name
                )));
            }
            arguments.push(Argument::new(arg.clone()));
        }
        Ok(Self {
            arguments,
            by_name,
            unknown: Vec::new(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&Argument> {
        self.by_name.get(name).map(|&i| &self.arguments[i])
    }

    /// Apply a single `name=value` token.
    ///
    /// Unknown names are remembered and reported by `check_complete`, so
    /// that typos show up next to the arguments they were meant to be.
    ///
    /// # Errors
    ///
    /// Returns `RunGenError::Usage` for malformed tokens, empty values, and
    /// arguments given more than once.
    pub fn resolve(&mut self, token: &str) -> Result<()> {
        let (name, value) = match token.split_once('=') {
            Some((name, value)) if !name.is_empty() && !value.contains('=') => (name, value),
            _ => return Err(RunGenError::Usage(format!("Invalid argument: {}", token))),
        };
        if value.is_empty() {
            return Err(RunGenError::Usage(format!(
                "Argument value is empty for: {}",
                name
            )));
        }

        let Some(&index) = self.by_name.get(name) else {
            self.unknown.push(name.to_string());
            return Ok(());
        };
        let arg = &mut self.arguments[index];
        if arg.explicit {
            return Err(RunGenError::Usage(format!(
                "Argument value specified multiple times for: {}",
                name
            )));
        }
        arg.raw = value.to_string();
        arg.explicit = true;
        Ok(())
    }

    /// Apply every token in order.
    pub fn resolve_all<S: AsRef<str>>(&mut self, tokens: &[S]) -> Result<()> {
        for token in tokens {
            self.resolve(token.as_ref())?;
        }
        Ok(())
    }

    /// Check that every argument has a value and no unknown names were given.
    ///
    /// With `tolerate_missing_outputs`, output buffers may be left out
    /// (benchmarking and memory tracking do not need to save anything).
    ///
    /// # Errors
    ///
    /// Returns one `RunGenError::Usage` listing every unknown and missing
    /// argument.
    pub fn check_complete(&self, tolerate_missing_outputs: bool) -> Result<()> {
        let mut problems: Vec<String> = self
            .unknown
            .iter()
            .map(|name| format!("Unknown argument name: {}", name))
            .collect();
        for arg in self.iter_by_name() {
            if arg.is_specified() {
                continue;
            }
            if tolerate_missing_outputs && arg.metadata.kind == ArgumentKind::OutputBuffer {
                continue;
            }
            problems.push(format!("Argument value missing for: {}", arg.name()));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(RunGenError::Usage(problems.join("\n")))
        }
    }

    /// Arguments sorted by name.
    pub fn iter_by_name(&self) -> impl Iterator<Item = &Argument> {
        self.by_name.values().map(|&i| &self.arguments[i])
    }

    /// Mutable arguments sorted by name.
    pub fn iter_by_name_mut(&mut self) -> impl Iterator<Item = &mut Argument> {
        let mut order: Vec<usize> = self.by_name.values().copied().collect();
        let mut slots: Vec<Option<&mut Argument>> = self.arguments.iter_mut().map(Some).collect();
        order.reverse();
        std::iter::from_fn(move || {
            let i = order.pop()?;
            slots[i].take()
        })
    }

    /// Build the positional call vector.
    ///
    /// # Errors
    ///
    /// Returns `RunGenError::Usage` naming the first argument that has no
    /// resolved value.
    pub fn call_slots(&mut self) -> Result<Vec<ArgSlot<'_>>> {
        self.arguments
            .iter_mut()
            .map(|arg| match &mut arg.value {
                ArgValue::Scalar(v) => Ok(ArgSlot::Scalar(&*v)),
                ArgValue::Buffer(b) => Ok(ArgSlot::Buffer(b)),
                ArgValue::Unresolved => Err(RunGenError::Usage(format!(
                    "Argument \"{}\" has no value for the filter call",
                    arg.metadata.name
                ))),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeTag;

    fn metadata() -> FilterMetadata {
        FilterMetadata {
            name: "test".to_string(),
            arguments: vec![
                ArgumentMetadata::scalar("bias", TypeTag::INT32),
                ArgumentMetadata::scalar("user_context", TypeTag::HANDLE),
                ArgumentMetadata::input_buffer("in", TypeTag::UINT8, 2),
                ArgumentMetadata::output_buffer("out", TypeTag::UINT8, 2),
            ],
        }
    }

    #[test]
    fn test_resolve_and_complete() {
        let mut table = ArgumentTable::new(&metadata()).unwrap();
        table
            .resolve_all(&["bias=3", "in=zero:[10,10]", "out=/tmp/o.png"])
            .unwrap();
        table.check_complete(false).unwrap();
        assert_eq!(table.get("bias").unwrap().raw, "3");
        assert_eq!(table.get("user_context").unwrap().raw, "nullptr");
    }

    #[test]
    fn test_handle_may_be_given_once() {
        let mut table = ArgumentTable::new(&metadata()).unwrap();
        table.resolve("user_context=nullptr").unwrap();
        assert!(table.resolve("user_context=nullptr").is_err());
    }

    #[test]
    fn test_duplicate_is_fatal() {
        let mut table = ArgumentTable::new(&metadata()).unwrap();
        table.resolve("bias=1").unwrap();
        let err = table.resolve("bias=2").unwrap_err();
        assert!(err.to_string().contains("multiple times"), "got {}", err);
    }

    #[test]
    fn test_empty_value_is_fatal() {
        let mut table = ArgumentTable::new(&metadata()).unwrap();
        let err = table.resolve("bias=").unwrap_err();
        assert!(err.to_string().contains("empty"), "got {}", err);
        assert!(table.resolve("=3").is_err());
        assert!(table.resolve("bias").is_err());
        assert!(table.resolve("bias=1=2").is_err());
    }

    #[test]
    fn test_unknown_and_missing_reported_together() {
        let mut table = ArgumentTable::new(&metadata()).unwrap();
        table.resolve_all(&["bais=3", "inn=x.png", "in=x.png"]).unwrap();
        let err = table.check_complete(false).unwrap_err().to_string();
        assert!(err.contains("Unknown argument name: bais"), "{}", err);
        assert!(err.contains("Unknown argument name: inn"), "{}", err);
        assert!(err.contains("Argument value missing for: bias"), "{}", err);
        assert!(err.contains("Argument value missing for: out"), "{}", err);
        assert!(!err.contains("user_context"), "{}", err);
    }

    #[test]
    fn test_missing_outputs_tolerated() {
        let mut table = ArgumentTable::new(&metadata()).unwrap();
        table.resolve_all(&["bias=3", "in=zero:[4,4]"]).unwrap();
        assert!(table.check_complete(false).is_err());
        table.check_complete(true).unwrap();
    }

    #[test]
    fn test_duplicate_metadata_names_rejected() {
        let mut md = metadata();
        md.arguments.push(ArgumentMetadata::scalar("bias", TypeTag::FLOAT32));
        assert!(matches!(
            ArgumentTable::new(&md),
            Err(RunGenError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_name_order_iteration() {
        let mut table = ArgumentTable::new(&metadata()).unwrap();
        let names: Vec<&str> = table.iter_by_name().map(|a| a.name()).collect();
        assert_eq!(names, vec!["bias", "in", "out", "user_context"]);
        let names: Vec<String> = table.iter_by_name_mut().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["bias", "in", "out", "user_context"]);
    }

    #[test]
    fn test_call_slots_require_values() {
        let mut table = ArgumentTable::new(&metadata()).unwrap();
        assert!(table.call_slots().is_err());
    }
}

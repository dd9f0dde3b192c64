//! Option resolution.
//!
//! Every node ends up with exactly one option set. Override requirements set
//! options authoritatively; everything else falls back to the recipe's
//! declared defaults. Disagreeing overrides are an error, never decided by
//! visitation order.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::graph::{Graph, LifecycleState};
use crate::package::OptionValue;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionError {
  /// Two or more overrides set one option of one package to different values.
  #[error("option conflict on {name}:{option}: overridden differently by {}", .conflicting_sources.join(", "))]
  OptionConflict {
    name: String,
    option: String,
    conflicting_sources: Vec<String>,
  },

  #[error("{source_name} overrides option '{option}' which {name} does not declare")]
  UnknownOption {
    name: String,
    option: String,
    source_name: String,
  },

  #[error("{source_name} sets {name}:{option} to a {found} value, but it is declared as {expected}")]
  OptionTypeMismatch {
    name: String,
    option: String,
    source_name: String,
    expected: &'static str,
    found: &'static str,
  },

  #[error("{source_name} sets {name}:{option} to '{value}', expected one of: {}", .allowed.join(", "))]
  InvalidChoice {
    name: String,
    option: String,
    source_name: String,
    value: String,
    allowed: Vec<String>,
  },
}

/// Resolve the final options of every node in the graph.
pub fn resolve(graph: &mut Graph) -> Result<(), OptionError> {
  let order = graph.topological_order().to_vec();

  for id in order {
    let node = graph.node(id);
    let name = node.package.name.clone();
    let defaults = node.recipe.default_options();
    let choices = node.recipe.option_choices();

    // option -> [(source, value)] from override edges, in visitation order
    let mut requests: BTreeMap<&str, Vec<(&str, &OptionValue)>> = BTreeMap::new();
    for edge in node.incoming.iter().filter(|e| e.is_override) {
      for (option, value) in &edge.options {
        requests
          .entry(option.as_str())
          .or_default()
          .push((edge.consumer_name.as_str(), value));
      }
    }

    let mut resolved = defaults.clone();
    for (option, sources) in &requests {
      let (first_source, value) = sources[0];

      if sources.iter().any(|(_, v)| *v != value) {
        let mut conflicting_sources: Vec<String> = Vec::new();
        for (source, _) in sources {
          if !conflicting_sources.iter().any(|s| s.as_str() == *source) {
            conflicting_sources.push(source.to_string());
          }
        }
        return Err(OptionError::OptionConflict {
          name,
          option: option.to_string(),
          conflicting_sources,
        });
      }

      let Some(default) = defaults.get(*option) else {
        return Err(OptionError::UnknownOption {
          name,
          option: option.to_string(),
          source_name: first_source.to_string(),
        });
      };

      if !value.same_kind(default) {
        return Err(OptionError::OptionTypeMismatch {
          name,
          option: option.to_string(),
          source_name: first_source.to_string(),
          expected: default.kind(),
          found: value.kind(),
        });
      }

      if let OptionValue::Enum(selected) = value
        && let Some(allowed) = choices.get(*option)
        && !allowed.contains(selected)
      {
        return Err(OptionError::InvalidChoice {
          name,
          option: option.to_string(),
          source_name: first_source.to_string(),
          value: selected.clone(),
          allowed: allowed.clone(),
        });
      }

      resolved.insert(option.to_string(), value.clone());
    }

    for edge in node.incoming.iter().filter(|e| !e.is_override) {
      for (option, value) in &edge.options {
        if resolved.get(option) != Some(value) {
          debug!(
            package = %name,
            option = %option,
            requested = %value,
            source = %edge.consumer_name,
            "ignoring non-override option request"
          );
        }
      }
    }

    let node = graph.node_mut(id);
    node.options = resolved;
    node.state = LifecycleState::OptionsResolved;
  }

  Ok(())
}

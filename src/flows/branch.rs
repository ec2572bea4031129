// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Route selection for branch nodes.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::flows::definition::{BranchNode, ConditionOperator, ConditionType, IntentOption};
use crate::flows::interpolate::lookup_variable;
use crate::services::{ChatMessage, LlmClient};
use crate::utils::helpers::value_to_text;

/// The output handle a branch chose and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchOutcome {
    pub output: String,
    pub condition: String,
}

impl BranchOutcome {
    fn new(output: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            condition: condition.into(),
        }
    }
}

/// Choose an output for `node` given the latest user input.
///
/// Keyword and variable strategies are pure. Intent strategies ask `llm` for a
/// label when one is available and fall back to substring matching on the
/// labels and their examples otherwise. Anything that matches nothing takes
/// the node's default output.
pub async fn evaluate(
    node: &BranchNode,
    input: &str,
    variables: &HashMap<String, Value>,
    llm: Option<&dyn LlmClient>,
) -> BranchOutcome {
    let matched = match node.condition_type {
        ConditionType::Keyword => match_keywords(node, input),
        ConditionType::Variable => match_conditions(node, variables),
        ConditionType::Intent | ConditionType::AiClassification => match llm {
            Some(llm) => classify_with_llm(&node.intents, input, llm).await,
            None => match_intent_substrings(&node.intents, input),
        },
    };
    matched.unwrap_or_else(|| BranchOutcome::new(node.default_output.clone(), "default"))
}

/// First keyword set, in declaration order, with a word contained in the
/// input (case-insensitive).
pub fn match_keywords(node: &BranchNode, input: &str) -> Option<BranchOutcome> {
    let input = input.to_lowercase();
    node.keywords.iter().find_map(|set| {
        set.words
            .iter()
            .find(|w| !w.is_empty() && input.contains(&w.to_lowercase()))
            .map(|w| BranchOutcome::new(set.output.clone(), format!("keyword '{w}'")))
    })
}

/// First condition, in declaration order, that holds.
pub fn match_conditions(
    node: &BranchNode,
    variables: &HashMap<String, Value>,
) -> Option<BranchOutcome> {
    node.conditions.iter().find_map(|c| {
        compare(c.operator, lookup_variable(variables, &c.variable), &c.value).then(|| {
            BranchOutcome::new(
                c.output.clone(),
                format!(
                    "{} {} {}",
                    c.variable,
                    c.operator.as_str(),
                    value_to_text(&c.value)
                ),
            )
        })
    })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

/// Apply `operator` to a variable's value.
pub fn compare(operator: ConditionOperator, actual: Option<&Value>, expected: &Value) -> bool {
    match operator {
        ConditionOperator::Empty => is_empty_value(actual),
        ConditionOperator::NotEmpty => !is_empty_value(actual),
        ConditionOperator::Equals => match actual {
            Some(actual) if actual == expected => true,
            Some(actual) => match (as_number(actual), as_number(expected)) {
                (Some(a), Some(b)) => a == b,
                _ => value_to_text(actual).eq_ignore_ascii_case(&value_to_text(expected)),
            },
            None => false,
        },
        ConditionOperator::Contains => actual.is_some_and(|actual| {
            value_to_text(actual)
                .to_lowercase()
                .contains(&value_to_text(expected).to_lowercase())
        }),
        ConditionOperator::Greater => match (actual.and_then(as_number), as_number(expected)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConditionOperator::Less => match (actual.and_then(as_number), as_number(expected)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        ConditionOperator::Regex => {
            let Some(actual) = actual else {
                return false;
            };
            match Regex::new(&value_to_text(expected)) {
                Ok(re) => re.is_match(&value_to_text(actual)),
                Err(e) => {
                    tracing::warn!("branch: invalid regex condition: {}", e);
                    false
                }
            }
        }
    }
}

/// Substring fallback: a label or any of its examples appearing in the input.
pub fn match_intent_substrings(intents: &[IntentOption], input: &str) -> Option<BranchOutcome> {
    let input = input.to_lowercase();
    intents.iter().find_map(|intent| {
        std::iter::once(&intent.label)
            .chain(intent.examples.iter())
            .find(|phrase| !phrase.is_empty() && input.contains(&phrase.to_lowercase()))
            .map(|phrase| {
                BranchOutcome::new(intent.output(), format!("intent '{}' ~ '{phrase}'", intent.label))
            })
    })
}

async fn classify_with_llm(
    intents: &[IntentOption],
    input: &str,
    llm: &dyn LlmClient,
) -> Option<BranchOutcome> {
    if intents.is_empty() {
        return None;
    }

    let mut catalogue = String::new();
    for intent in intents {
        catalogue.push_str("- ");
        catalogue.push_str(&intent.label);
        if let Some(description) = &intent.description {
            catalogue.push_str(": ");
            catalogue.push_str(description);
        }
        if !intent.examples.is_empty() {
            catalogue.push_str(&format!(" (e.g. {})", intent.examples.join("; ")));
        }
        catalogue.push('\n');
    }

    let messages = [
        ChatMessage::system(format!(
            "Classify the caller's message into exactly one of these intents:\n{catalogue}\
             Reply with the intent label only, or \"none\" if nothing fits."
        )),
        ChatMessage::user(input),
    ];

    let reply = match llm.complete(&messages).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!("branch: intent classification failed, using fallback: {}", e);
            return match_intent_substrings(intents, input);
        }
    };

    let label = reply
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.')
        .to_lowercase();
    intents
        .iter()
        .find(|i| i.label.to_lowercase() == label)
        .or_else(|| {
            intents
                .iter()
                .find(|i| label.contains(&i.label.to_lowercase()))
        })
        .map(|i| BranchOutcome::new(i.output(), format!("intent '{}' (llm)", i.label)))
}

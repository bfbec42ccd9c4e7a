//! Environment macro expansion.
//!
//! References take the forms `${NAME}`, `$(NAME)`, `${NAME=default}` or
//! `$(NAME=default)`. Values come from a snapshot of the process environment taken
//! when the [`MacroEnvironment`] is created. A reference to an undefined name without
//! a default is left in the text unchanged.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_until, take_while1},
    character::complete::char,
    combinator::{map, recognize},
    multi::many0,
    sequence::terminated,
};
use std::{collections::HashMap, env};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct MacroEnvironment {
    values: HashMap<String, String>,
}

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Literal(&'a str),
    Reference {
        raw: &'a str,
        name: &'a str,
        default: Option<&'a str>,
    },
}

impl MacroEnvironment {
    /// Capture the current process environment
    pub fn snapshot() -> Self {
        Self::from_pairs(env::vars_os().filter_map(|(k, v)| {
            Some((k.into_string().ok()?, v.into_string().ok()?))
        }))
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        MacroEnvironment {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Substitute every macro reference in `input`
    pub fn expand(&self, input: &str) -> String {
        let Ok((rest, tokens)) = many0(token).parse(input) else {
            return input.to_string();
        };
        let mut output = String::with_capacity(input.len());
        for token in tokens {
            match token {
                Token::Literal(text) => output.push_str(text),
                Token::Reference { raw, name, default } => {
                    match self.get(name).or(default) {
                        Some(value) => output.push_str(value),
                        None => {
                            debug!("Macro '{name}' is undefined, leaving '{raw}' in place");
                            output.push_str(raw);
                        }
                    }
                }
            }
        }
        output.push_str(rest);
        output
    }
}

fn token(input: &str) -> IResult<&str, Token<'_>> {
    alt((
        reference,
        map(take_while1(|c: char| c != '$'), Token::Literal),
        map(tag("$"), Token::Literal),
    ))
    .parse(input)
}

fn reference(input: &str) -> IResult<&str, Token<'_>> {
    let (rest, raw) = recognize(alt((
        (tag("${"), terminated(take_until("}"), char('}'))),
        (tag("$("), terminated(take_until(")"), char(')'))),
    )))
    .parse(input)?;
    let body = &raw[2..raw.len() - 1];
    let (name, default) = match body.split_once('=') {
        Some((name, default)) => (name, Some(default)),
        None => (body, None),
    };
    Ok((rest, Token::Reference { raw, name, default }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> MacroEnvironment {
        MacroEnvironment::from_pairs([("ROOT", "/data"), ("HOST", "ndxhost"), ("EMPTY", "")])
    }

    #[test]
    fn expands_both_syntaxes() {
        let env = env();
        assert_eq!(env.expand("${ROOT}/netvar.xml"), "/data/netvar.xml");
        assert_eq!(env.expand(r"\\$(HOST)\lib\var"), r"\\ndxhost\lib\var");
        assert_eq!(env.expand("${ROOT}$(HOST)"), "/datandxhost");
        assert_eq!(env.expand("${EMPTY}x"), "x");
    }

    #[test]
    fn defaults_apply_only_when_undefined() {
        let env = env();
        assert_eq!(env.expand("${MISSING=fallback}"), "fallback");
        assert_eq!(env.expand("$(HOST=other)"), "ndxhost");
        assert_eq!(env.expand("${MISSING=}"), "");
    }

    #[test]
    fn undefined_references_stay_verbatim() {
        let env = env();
        assert_eq!(env.expand("${MISSING}/x"), "${MISSING}/x");
        assert_eq!(env.expand("cost $5"), "cost $5");
        assert_eq!(env.expand("${unterminated"), "${unterminated");
        assert_eq!(env.expand("no macros here"), "no macros here");
    }
}

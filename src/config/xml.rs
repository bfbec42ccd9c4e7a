//! A small XML reader, sufficient for configuration files.
//!
//! Elements, attributes (single or double quoted), comments, processing instructions,
//! a doctype declaration and CDATA sections are understood. Text content is skipped,
//! since configuration is carried entirely in attributes.

use nom::{
    Finish, IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_until, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{all_consuming, map, opt, value},
    multi::many0,
    sequence::{delimited, preceded},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

/// Position and reason of a parse failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlError {
    pub line: usize,
    pub column: usize,
    pub reason: String,
}

/// Parse a complete document, returning its root element
pub fn parse_document(input: &str) -> Result<Element, XmlError> {
    match all_consuming(document).parse(input).finish() {
        Ok((_, root)) => Ok(root),
        Err(e) => {
            let consumed = &input[..input.len() - e.input.len()];
            let line = consumed.matches('\n').count() + 1;
            let column = consumed.len() - consumed.rfind('\n').map(|p| p + 1).unwrap_or(0) + 1;
            Err(XmlError {
                line,
                column,
                reason: format!("{:?}", e.code),
            })
        }
    }
}

fn document(input: &str) -> IResult<&str, Element> {
    delimited(many0(prolog_item), element, many0(prolog_item)).parse(input)
}

fn prolog_item(input: &str) -> IResult<&str, ()> {
    alt((
        value((), multispace1),
        comment,
        processing_instruction,
        doctype,
    ))
    .parse(input)
}

fn comment(input: &str) -> IResult<&str, ()> {
    value((), (tag("<!--"), take_until("-->"), tag("-->"))).parse(input)
}

fn processing_instruction(input: &str) -> IResult<&str, ()> {
    value((), (tag("<?"), take_until("?>"), tag("?>"))).parse(input)
}

fn doctype(input: &str) -> IResult<&str, ()> {
    value((), (tag("<!DOCTYPE"), take_until(">"), tag(">"))).parse(input)
}

fn cdata(input: &str) -> IResult<&str, ()> {
    value((), (tag("<![CDATA["), take_until("]]>"), tag("]]>"))).parse(input)
}

fn text(input: &str) -> IResult<&str, ()> {
    value((), take_while1(|c: char| c != '<')).parse(input)
}

fn name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')).parse(input)
}

fn attribute(input: &str) -> IResult<&str, (String, String)> {
    map(
        (
            preceded(multispace1, name),
            delimited(multispace0, char('='), multispace0),
            alt((
                delimited(char('"'), take_until("\""), char('"')),
                delimited(char('\''), take_until("'"), char('\'')),
            )),
        ),
        |(key, _, raw): (&str, char, &str)| (key.to_string(), unescape(raw)),
    )
    .parse(input)
}

fn node(input: &str) -> IResult<&str, Option<Element>> {
    alt((
        map(element, Some),
        value(None, comment),
        value(None, cdata),
        value(None, processing_instruction),
        value(None, text),
    ))
    .parse(input)
}

fn element(input: &str) -> IResult<&str, Element> {
    let (input, (_, tag_name, attributes, _)) =
        (char('<'), name, many0(attribute), multispace0).parse(input)?;
    let (input, self_closing) = opt(tag("/>")).parse(input)?;
    if self_closing.is_some() {
        return Ok((
            input,
            Element {
                name: tag_name.to_string(),
                attributes,
                children: Vec::new(),
            },
        ));
    }
    let (input, _) = char('>').parse(input)?;
    let (input, nodes) = many0(node).parse(input)?;
    let (input, _) = (tag("</"), tag(tag_name), multispace0, char('>')).parse(input)?;
    Ok((
        input,
        Element {
            name: tag_name.to_string(),
            attributes,
            children: nodes.into_iter().flatten().collect(),
        },
    ))
}

fn unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

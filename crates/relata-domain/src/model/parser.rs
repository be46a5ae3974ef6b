//! DSL parser for authorization models.
//!
//! Parses the model DSL into [`AuthorizationModel`] structures.
//!
//! Example DSL:
//! ```text
//! type user
//!
//! type document
//!   relations
//!     define owner: [user]
//!     define editor: [user, group#member] or owner
//!     define viewer: [user, user:*] or editor or viewer from parent
//!     define parent: [folder]
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace1, space0, space1},
    combinator::{all_consuming, map, opt, recognize, success, value},
    error::{context, ContextError, ParseError},
    multi::{many0, many1, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use super::{AuthorizationModel, RelationDefinition, RelationReference, TypeDefinition, Userset};

/// Parser error type with context for better error messages.
#[derive(Debug, Clone, PartialEq)]
pub struct ParserError {
    pub message: String,
}

impl ParserError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ParserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParserError {}

/// Result type for parser operations.
pub type ParserResult<T> = Result<T, ParserError>;

// ============ Helper Parsers ============

/// Parse a comment (# to end of line)
fn comment<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, (), E> {
    value((), pair(char('#'), take_while(|c| c != '\n' && c != '\r')))(input)
}

/// Parse whitespace including comments
fn ws<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, (), E> {
    value((), many0(alt((value((), multispace1), comment))))(input)
}

/// Reserved keywords that cannot be used as identifiers
const RESERVED_KEYWORDS: &[&str] = &[
    "type",
    "relations",
    "define",
    "or",
    "and",
    "but",
    "not",
    "from",
    "this",
];

/// Check if a string is a reserved keyword
fn is_reserved(s: &str) -> bool {
    RESERVED_KEYWORDS.contains(&s)
}

/// Parse an identifier matching `[A-Za-z_][A-Za-z0-9_-]*`, not a reserved keyword
fn identifier<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, &'a str, E> {
    let (rest, id) = recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
    ))(input)?;

    if is_reserved(id) {
        return Err(nom::Err::Error(E::from_error_kind(
            input,
            nom::error::ErrorKind::Tag,
        )));
    }

    Ok((rest, id))
}

// ============ Restriction Parsers ============

/// Parse a single restriction item: "user", "group#member" or "user:*"
fn single_restriction<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, RelationReference, E> {
    alt((
        map(terminated(identifier, tag(":*")), |t: &str| {
            RelationReference::Wildcard(t.to_string())
        }),
        map(
            pair(identifier, preceded(char('#'), identifier)),
            |(t, r): (&str, &str)| RelationReference::Userset {
                r#type: t.to_string(),
                relation: r.to_string(),
            },
        ),
        map(identifier, |t: &str| {
            RelationReference::Direct(t.to_string())
        }),
    ))(input)
}

/// Parse a restriction list like [user] or [user, group#member, user:*]
fn restriction_list<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Vec<RelationReference>, E> {
    context(
        "restriction list",
        delimited(
            char('['),
            separated_list1(tuple((space0, char(','), space0)), single_restriction),
            char(']'),
        ),
    )(input)
}

// ============ Userset Parsers ============

/// Parse a direct relation reference (just a relation name)
fn parse_computed_userset<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Userset, E> {
    map(identifier, |name: &str| Userset::ComputedUserset {
        relation: name.to_string(),
    })(input)
}

/// Parse "relation from tupleset" (tuple to userset)
fn parse_tuple_to_userset<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Userset, E> {
    context(
        "tuple to userset",
        map(
            tuple((identifier, space1, tag("from"), space1, identifier)),
            |(computed, _, _, _, tupleset): (&str, _, _, _, &str)| Userset::TupleToUserset {
                tupleset: tupleset.to_string(),
                computed_userset: computed.to_string(),
            },
        ),
    )(input)
}

/// Parse a base userset (tuple_to_userset or computed)
fn parse_base_userset<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Userset, E> {
    alt((parse_tuple_to_userset, parse_computed_userset))(input)
}

/// Parse a userset with "but not" difference (binds tighter than and/or)
fn parse_difference_or_base<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Userset, E> {
    let difference_result: IResult<&str, Userset, E> = context(
        "difference",
        map(
            tuple((
                parse_base_userset,
                space1,
                tag("but"),
                space1,
                tag("not"),
                space1,
                parse_base_userset,
            )),
            |(base, _, _, _, _, _, subtract)| Userset::Difference {
                base: Box::new(base),
                subtract: Box::new(subtract),
            },
        ),
    )(input);

    match difference_result {
        Ok(result) => Ok(result),
        Err(_) => parse_base_userset(input),
    }
}

/// Parse intersection level (and binds tighter than or)
fn parse_intersection_level<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Userset, E> {
    let (rest, first) = parse_difference_or_base(input)?;

    let (rest, and_operands) = many0(preceded(
        tuple((space0, tag("and"), space1)),
        parse_difference_or_base,
    ))(rest)?;

    if and_operands.is_empty() {
        Ok((rest, first))
    } else {
        let mut children = vec![first];
        children.extend(and_operands);
        Ok((rest, Userset::Intersection { children }))
    }
}

/// Parse union level (lowest precedence)
fn parse_union_level<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Userset, E> {
    let (rest, first) = parse_intersection_level(input)?;

    let (rest, or_operands) = many0(preceded(
        tuple((space0, tag("or"), space1)),
        parse_intersection_level,
    ))(rest)?;

    if or_operands.is_empty() {
        Ok((rest, first))
    } else {
        let mut children = vec![first];
        children.extend(or_operands);
        Ok((rest, Userset::Union { children }))
    }
}

/// Operator continuations after a leading restriction list.
#[derive(Debug, Clone)]
enum Continuation {
    /// No continuation found
    None,
    /// "or" operands (union semantics)
    Or(Vec<Userset>),
    /// "and" operands (intersection semantics)
    And(Vec<Userset>),
    /// "but not" operand (difference semantics)
    ButNot(Userset),
}

/// Parse the or/and/but-not operands following a restriction list.
///
/// Each operand parses at the level required by operator precedence:
/// `or` operands at intersection level, `and` operands at difference level.
fn parse_continuation<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Continuation, E> {
    alt((
        map(
            many1(preceded(
                tuple((space0, tag("or"), space1)),
                parse_intersection_level,
            )),
            Continuation::Or,
        ),
        map(
            many1(preceded(
                tuple((space0, tag("and"), space1)),
                parse_difference_or_base,
            )),
            Continuation::And,
        ),
        map(
            preceded(
                tuple((space0, tag("but"), space1, tag("not"), space1)),
                parse_base_userset,
            ),
            Continuation::ButNot,
        ),
        success(Continuation::None),
    ))(input)
}

// ============ Relation Definition Parser ============

/// Parse a relation definition like "define viewer: [user] or editor"
fn parse_relation_definition<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, RelationDefinition, E> {
    context(
        "relation definition",
        map(
            tuple((
                space0,
                tag("define"),
                space1,
                identifier,
                char(':'),
                space0,
                opt(restriction_list),
                opt(preceded(space0, parse_union_level)),
                parse_continuation,
            )),
            |(_, _, _, name, _, _, restrictions, userset, continuation): (
                _,
                _,
                _,
                &str,
                _,
                _,
                Option<Vec<RelationReference>>,
                Option<Userset>,
                Continuation,
            )| {
                // A leading restriction list stands for This; an explicit
                // userset expression otherwise.
                let base = userset.unwrap_or(Userset::This);

                let rewrite = match continuation {
                    Continuation::None => base,
                    Continuation::Or(operands) => {
                        let mut children = vec![base];
                        children.extend(operands);
                        Userset::Union { children }
                    }
                    Continuation::And(operands) => {
                        let mut children = vec![base];
                        children.extend(operands);
                        Userset::Intersection { children }
                    }
                    Continuation::ButNot(subtract) => Userset::Difference {
                        base: Box::new(base),
                        subtract: Box::new(subtract),
                    },
                };

                RelationDefinition {
                    name: name.to_string(),
                    rewrite,
                    directly_related_user_types: restrictions.unwrap_or_default(),
                }
            },
        ),
    )(input)
}

// ============ Type Definition Parser ============

/// Parse a type definition with optional relations
fn parse_type_definition<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, TypeDefinition, E> {
    context(
        "type definition",
        map(
            tuple((
                tag("type"),
                space1,
                identifier,
                ws,
                opt(preceded(
                    tuple((tag("relations"), ws)),
                    many0(terminated(parse_relation_definition, ws)),
                )),
            )),
            |(_, _, type_name, _, relations): (_, _, &str, _, _)| TypeDefinition {
                type_name: type_name.to_string(),
                relations: relations.unwrap_or_default(),
            },
        ),
    )(input)
}

/// Parse a complete model: one or more type definitions
fn parse_model<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Vec<TypeDefinition>, E> {
    all_consuming(delimited(
        ws,
        many1(terminated(parse_type_definition, ws)),
        ws,
    ))(input)
}

/// Parses the model DSL into an [`AuthorizationModel`].
///
/// The returned model has no id; ids are assigned when the model is written.
pub fn parse(input: &str) -> ParserResult<AuthorizationModel> {
    match parse_model::<nom::error::VerboseError<&str>>(input) {
        Ok((_, type_definitions)) => Ok(AuthorizationModel::with_types("1.1", type_definitions)),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let summary = e
                .errors
                .iter()
                .rev()
                .find_map(|(_, kind)| match kind {
                    nom::error::VerboseErrorKind::Context(ctx) => Some(*ctx),
                    _ => None,
                })
                .unwrap_or("model");
            Err(ParserError::new(format!("failed to parse {summary}")))
        }
        Err(nom::Err::Incomplete(_)) => Err(ParserError::new("unexpected end of input")),
    }
}

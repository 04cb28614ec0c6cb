//! Lexer and recursive-descent parser for the query grammar:
//!
//! ```text
//! Query      := Statement+
//! Statement  := "bbox" "(" Float "," Float "," Float "," Float ")"
//!               "." QueryType "{" FilterExpr "}"
//! FilterExpr := Or
//! Or         := And ("OR" And)*
//! And        := Not (("AND")? Not)*        // AND implicit by juxtaposition
//! Not        := "!" Atom | Atom
//! Atom       := "(" FilterExpr ")" | SubStmt | TagCond | KeyCond
//! SubStmt    := "." QueryType "{" FilterExpr "}"
//! ```
//!
//! Whitespace and `// line comments` are ignored. Literals are resolved
//! against the dictionary during parsing, including the translation of
//! ordering operators through `next_lower_value_index`.

use geo_types::{Coord, Rect};

use crate::dictionary::TagDictionary;
use crate::feature::FeatureKind;
use crate::query::filter::{invalid_pairing, pairing_is_valid, CompareOp, FilterExpr, SubStatement};
use crate::query::{LocationExpr, Query, QueryType, Statement};
use crate::{Error, Result};

pub(super) fn parse_query(input: &str, dictionary: &TagDictionary) -> Result<Query> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0, end: input.len(), dictionary, slots: 0 };
    let mut statements = Vec::new();
    while !parser.at_end() {
        statements.push(parser.statement()?);
    }
    if statements.is_empty() {
        return Err(syntax(0, "empty query"));
    }
    Ok(Query { statements })
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Str(String),
    Number(String),
    Dot,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Bang,
    Star,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

fn syntax(position: usize, message: impl Into<String>) -> Error {
    Error::QuerySyntax { position, message: message.into() }
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let pos = i;
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'.' => {
                tokens.push(Token { kind: TokenKind::Dot, pos });
                i += 1;
            }
            b'{' => {
                tokens.push(Token { kind: TokenKind::LBrace, pos });
                i += 1;
            }
            b'}' => {
                tokens.push(Token { kind: TokenKind::RBrace, pos });
                i += 1;
            }
            b'(' => {
                tokens.push(Token { kind: TokenKind::LParen, pos });
                i += 1;
            }
            b')' => {
                tokens.push(Token { kind: TokenKind::RParen, pos });
                i += 1;
            }
            b',' => {
                tokens.push(Token { kind: TokenKind::Comma, pos });
                i += 1;
            }
            b'*' => {
                tokens.push(Token { kind: TokenKind::Star, pos });
                i += 1;
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Ne, pos });
                    i += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Bang, pos });
                    i += 1;
                }
            }
            b'=' => {
                tokens.push(Token { kind: TokenKind::Eq, pos });
                i += 1;
            }
            b'<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Le, pos });
                    i += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Lt, pos });
                    i += 1;
                }
            }
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Ge, pos });
                    i += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Gt, pos });
                    i += 1;
                }
            }
            b'"' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(syntax(pos, "unterminated string")),
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => match bytes.get(i + 1) {
                            Some(b'"') => {
                                value.push('"');
                                i += 2;
                            }
                            Some(b'\\') => {
                                value.push('\\');
                                i += 2;
                            }
                            _ => return Err(syntax(i, "unsupported escape")),
                        },
                        Some(_) => {
                            // take the whole utf-8 sequence in one go
                            let rest = &input[i..];
                            let ch = rest.chars().next().unwrap_or('\u{fffd}');
                            value.push(ch);
                            i += ch.len_utf8();
                        }
                    }
                }
                tokens.push(Token { kind: TokenKind::Str(value), pos });
            }
            b'-' | b'0'..=b'9' => {
                let mut end = i + 1;
                while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
                    end += 1;
                }
                tokens.push(Token { kind: TokenKind::Number(input[i..end].to_string()), pos });
                i = end;
            }
            c if (c as char).is_ascii_alphabetic() || c == b'_' => {
                let mut end = i + 1;
                while end < bytes.len()
                    && ((bytes[end] as char).is_ascii_alphanumeric()
                        || bytes[end] == b'_'
                        || bytes[end] == b':')
                {
                    end += 1;
                }
                tokens.push(Token { kind: TokenKind::Ident(input[i..end].to_string()), pos });
                i = end;
            }
            _ => {
                let ch = input[i..].chars().next().unwrap_or('\u{fffd}');
                return Err(syntax(pos, format!("unexpected character `{ch}`")));
            }
        }
    }
    Ok(tokens)
}

enum Literal {
    Text(String),
    /// `*`: any value for this key.
    Any,
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
    dictionary: &'a TagDictionary,
    /// Sub-statement instances seen in the current statement.
    slots: usize,
}

impl Parser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn here(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |token| token.pos)
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|token| &token.kind)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += token.is_some() as usize;
        token
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<()> {
        match self.peek() {
            Some(found) if *found == kind => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(syntax(self.here(), format!("expected {what}"))),
        }
    }

    fn statement(&mut self) -> Result<Statement> {
        self.slots = 0;
        let location = self.location()?;
        self.expect(TokenKind::Dot, "`.` after the location")?;
        let query_type = self.query_type()?;
        self.expect(TokenKind::LBrace, "`{` before the filter")?;
        let filter = self.or_expr(query_type.kind())?;
        self.expect(TokenKind::RBrace, "`}` after the filter")?;
        Ok(Statement { location, query_type, filter, slots: self.slots })
    }

    fn location(&mut self) -> Result<LocationExpr> {
        let pos = self.here();
        match self.bump().map(|token| token.kind) {
            Some(TokenKind::Ident(name)) if name == "bbox" => {}
            _ => return Err(syntax(pos, "expected `bbox(...)`")),
        }
        self.expect(TokenKind::LParen, "`(` after `bbox`")?;
        let min_lon = self.float()?;
        self.expect(TokenKind::Comma, "`,`")?;
        let min_lat = self.float()?;
        self.expect(TokenKind::Comma, "`,`")?;
        let max_lon = self.float()?;
        self.expect(TokenKind::Comma, "`,`")?;
        let max_lat = self.float()?;
        self.expect(TokenKind::RParen, "`)` closing `bbox`")?;
        Ok(LocationExpr::Bbox(Rect::new(
            Coord { x: min_lon, y: min_lat },
            Coord { x: max_lon, y: max_lat },
        )))
    }

    fn float(&mut self) -> Result<f64> {
        let pos = self.here();
        match self.bump().map(|token| token.kind) {
            Some(TokenKind::Number(raw)) => raw
                .parse()
                .map_err(|_| syntax(pos, format!("`{raw}` is not a number"))),
            _ => Err(syntax(pos, "expected a number")),
        }
    }

    fn query_type(&mut self) -> Result<QueryType> {
        let pos = self.here();
        match self.bump().map(|token| token.kind) {
            Some(TokenKind::Ident(name)) => match name.as_str() {
                "nodes" => Ok(QueryType::Nodes),
                "ways" => Ok(QueryType::Ways),
                "relations" => Ok(QueryType::Relations),
                "child_relations" => Ok(QueryType::ChildRelations),
                _ => Err(syntax(pos, format!("`{name}` is not a query type"))),
            },
            _ => Err(syntax(pos, "expected a query type")),
        }
    }

    fn or_expr(&mut self, context: FeatureKind) -> Result<FilterExpr> {
        let mut left = self.and_expr(context)?;
        while matches!(self.peek(), Some(TokenKind::Ident(name)) if name == "OR") {
            self.pos += 1;
            let right = self.and_expr(context)?;
            left = FilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self, context: FeatureKind) -> Result<FilterExpr> {
        let mut left = self.not_expr(context)?;
        loop {
            match self.peek() {
                Some(TokenKind::Ident(name)) if name == "AND" => {
                    self.pos += 1;
                }
                Some(TokenKind::Ident(name)) if name == "OR" => break,
                // juxtaposition is an implicit AND
                Some(TokenKind::Ident(_))
                | Some(TokenKind::Bang)
                | Some(TokenKind::LParen)
                | Some(TokenKind::Dot) => {}
                _ => break,
            }
            let right = self.not_expr(context)?;
            left = FilterExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self, context: FeatureKind) -> Result<FilterExpr> {
        if matches!(self.peek(), Some(TokenKind::Bang)) {
            self.pos += 1;
            let inner = self.atom(context)?;
            return Ok(FilterExpr::Not(Box::new(inner)));
        }
        self.atom(context)
    }

    fn atom(&mut self, context: FeatureKind) -> Result<FilterExpr> {
        let pos = self.here();
        match self.peek() {
            Some(TokenKind::LParen) => {
                self.pos += 1;
                let inner = self.or_expr(context)?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(inner)
            }
            Some(TokenKind::Dot) => self.sub_statement(context),
            Some(TokenKind::Ident(_)) => {
                let Some(Token { kind: TokenKind::Ident(key), .. }) = self.bump() else {
                    unreachable!("peeked an identifier")
                };
                let op = match self.peek() {
                    Some(TokenKind::Eq) => Some(CompareOp::Eq),
                    Some(TokenKind::Ne) => Some(CompareOp::Ne),
                    Some(TokenKind::Lt) => Some(CompareOp::Lt),
                    Some(TokenKind::Le) => Some(CompareOp::Le),
                    Some(TokenKind::Gt) => Some(CompareOp::Gt),
                    Some(TokenKind::Ge) => Some(CompareOp::Ge),
                    _ => None,
                };
                match op {
                    None => Ok(self.key_condition(&key)),
                    Some(op) => {
                        self.pos += 1;
                        let literal = self.literal()?;
                        self.tag_condition(&key, op, literal, pos)
                    }
                }
            }
            _ => Err(syntax(pos, "expected a filter")),
        }
    }

    fn sub_statement(&mut self, context: FeatureKind) -> Result<FilterExpr> {
        self.expect(TokenKind::Dot, "`.`")?;
        let query_type = self.query_type()?;
        if !pairing_is_valid(context, query_type) {
            return Err(invalid_pairing(context, query_type));
        }
        self.expect(TokenKind::LBrace, "`{` before the sub-filter")?;
        let filter = self.or_expr(query_type.kind())?;
        self.expect(TokenKind::RBrace, "`}` after the sub-filter")?;
        let slot = self.slots;
        self.slots += 1;
        Ok(FilterExpr::Sub(SubStatement { query_type, filter: Box::new(filter), slot }))
    }

    fn literal(&mut self) -> Result<Literal> {
        let pos = self.here();
        match self.bump().map(|token| token.kind) {
            Some(TokenKind::Ident(text)) => Ok(Literal::Text(text)),
            Some(TokenKind::Str(text)) => Ok(Literal::Text(text)),
            Some(TokenKind::Number(raw)) => Ok(Literal::Text(raw)),
            Some(TokenKind::Star) => Ok(Literal::Any),
            _ => Err(syntax(pos, "expected a value")),
        }
    }

    fn key_condition(&self, key: &str) -> FilterExpr {
        match self.dictionary.key_id(key) {
            Some(key) => FilterExpr::Key { key, present: true },
            // an unknown key is set on nothing
            None => FilterExpr::Never,
        }
    }

    fn tag_condition(
        &self,
        key: &str,
        op: CompareOp,
        literal: Literal,
        pos: usize,
    ) -> Result<FilterExpr> {
        let key_id = self.dictionary.key_id(key);
        if let Literal::Any = literal {
            return match op {
                CompareOp::Eq => Ok(match key_id {
                    Some(key) => FilterExpr::Key { key, present: true },
                    None => FilterExpr::Never,
                }),
                CompareOp::Ne => Ok(match key_id {
                    Some(key) => FilterExpr::Key { key, present: false },
                    None => FilterExpr::Not(Box::new(FilterExpr::Never)),
                }),
                _ => Err(syntax(pos, "`*` only combines with `=` and `!=`")),
            };
        }
        let Literal::Text(value) = literal else { unreachable!("`Any` handled above") };
        let Some(key) = key_id else {
            return Ok(FilterExpr::Never);
        };

        match op {
            CompareOp::Eq => Ok(match self.dictionary.value_id(key, &value) {
                Some(value) => FilterExpr::Tag { key, value, op: CompareOp::Eq },
                None => FilterExpr::Never,
            }),
            CompareOp::Ne => Ok(match self.dictionary.value_id(key, &value) {
                Some(value) => FilterExpr::Tag { key, value, op: CompareOp::Ne },
                None => FilterExpr::Never,
            }),
            CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
                let (index, exact) = self.dictionary.next_lower_value_index(key, &value);
                let below_all = index < 0;
                let index = index.max(0) as u32;
                Ok(match op {
                    CompareOp::Lt if exact => FilterExpr::Tag { key, value: index, op: CompareOp::Lt },
                    CompareOp::Lt | CompareOp::Le if below_all => FilterExpr::Never,
                    CompareOp::Lt | CompareOp::Le => {
                        FilterExpr::Tag { key, value: index, op: CompareOp::Le }
                    }
                    CompareOp::Ge if exact => FilterExpr::Tag { key, value: index, op: CompareOp::Ge },
                    CompareOp::Gt | CompareOp::Ge if below_all => {
                        // everything with the key sorts above the literal
                        FilterExpr::Key { key, present: true }
                    }
                    CompareOp::Gt | CompareOp::Ge => {
                        FilterExpr::Tag { key, value: index, op: CompareOp::Gt }
                    }
                    _ => unreachable!("ordering operators only"),
                })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dictionary() -> TagDictionary {
        let mut dictionary = TagDictionary::default();
        dictionary.add([("amenity", "bench"), ("seats", "2")]).unwrap();
        dictionary.add([("amenity", "restaurant"), ("seats", "10")]).unwrap();
        dictionary.add([("seats", "3")]).unwrap();
        dictionary.add([("name", "main bench")]).unwrap();
        dictionary.finalize();
        dictionary
    }

    fn parse(input: &str) -> Result<Query> {
        parse_query(input, &dictionary())
    }

    #[test]
    fn simple_statement() {
        let query = parse("bbox(1.0,2.0,3.0,4.0).nodes{ amenity=bench }").unwrap();
        insta::assert_debug_snapshot!(query.statements[0].filter, @r"
        Tag {
            key: 0,
            value: 0,
            op: Eq,
        }
        ");
        assert_eq!(query.statements[0].query_type, QueryType::Nodes);
        let LocationExpr::Bbox(bbox) = query.statements[0].location;
        assert_eq!(bbox.min(), Coord { x: 1.0, y: 2.0 });
        assert_eq!(bbox.max(), Coord { x: 3.0, y: 4.0 });
    }

    #[test]
    fn implicit_and_and_quoting() {
        let query =
            parse("bbox(0,0,1,1).nodes{ amenity=bench seats>=3 name=\"main bench\" }").unwrap();
        insta::assert_debug_snapshot!(query.statements[0].filter, @r"
        And(
            And(
                Tag {
                    key: 0,
                    value: 0,
                    op: Eq,
                },
                Tag {
                    key: 1,
                    value: 1,
                    op: Ge,
                },
            ),
            Tag {
                key: 2,
                value: 0,
                op: Eq,
            },
        )
        ");
    }

    #[test]
    fn or_and_not_and_parens() {
        let query = parse(
            "// benches or unnamed restaurants\n\
             bbox(0,0,1,1).nodes{ amenity=bench OR (amenity=restaurant AND !name) }",
        )
        .unwrap();
        let FilterExpr::Or(_, right) = &query.statements[0].filter else {
            panic!("expected an OR")
        };
        let FilterExpr::And(_, negated) = right.as_ref() else { panic!("expected an AND") };
        assert_eq!(**negated, FilterExpr::Not(Box::new(FilterExpr::Key { key: 2, present: true })));
    }

    #[test]
    fn range_operators_translate_through_the_dictionary() {
        // seats sorts 2 < 3 < 10
        let filter = |input: &str| parse(input).unwrap().statements.remove(0).filter;
        assert_eq!(
            filter("bbox(0,0,1,1).nodes{ seats<3 }"),
            FilterExpr::Tag { key: 1, value: 1, op: CompareOp::Lt }
        );
        assert_eq!(
            filter("bbox(0,0,1,1).nodes{ seats<=5 }"),
            FilterExpr::Tag { key: 1, value: 1, op: CompareOp::Le }
        );
        assert_eq!(
            filter("bbox(0,0,1,1).nodes{ seats>=3 }"),
            FilterExpr::Tag { key: 1, value: 1, op: CompareOp::Ge }
        );
        assert_eq!(
            filter("bbox(0,0,1,1).nodes{ seats>5 }"),
            FilterExpr::Tag { key: 1, value: 1, op: CompareOp::Gt }
        );
        // below every stored value
        assert_eq!(filter("bbox(0,0,1,1).nodes{ seats<1 }"), FilterExpr::Never);
        assert_eq!(
            filter("bbox(0,0,1,1).nodes{ seats>=1 }"),
            FilterExpr::Key { key: 1, present: true }
        );
    }

    #[test]
    fn star_is_key_presence() {
        let filter = |input: &str| parse(input).unwrap().statements.remove(0).filter;
        assert_eq!(
            filter("bbox(0,0,1,1).nodes{ amenity=* }"),
            FilterExpr::Key { key: 0, present: true }
        );
        assert_eq!(
            filter("bbox(0,0,1,1).nodes{ amenity!=* }"),
            FilterExpr::Key { key: 0, present: false }
        );
        assert!(matches!(
            parse("bbox(0,0,1,1).nodes{ amenity>* }"),
            Err(Error::QuerySyntax { .. })
        ));
    }

    #[test]
    fn unknown_strings_match_nothing() {
        let filter = |input: &str| parse(input).unwrap().statements.remove(0).filter;
        assert_eq!(filter("bbox(0,0,1,1).nodes{ building=yes }"), FilterExpr::Never);
        assert_eq!(filter("bbox(0,0,1,1).nodes{ amenity=fountain }"), FilterExpr::Never);
        // but absence of an unknown key holds for everything
        assert_eq!(
            filter("bbox(0,0,1,1).nodes{ !building }"),
            FilterExpr::Not(Box::new(FilterExpr::Never))
        );
    }

    #[test]
    fn sub_statements_nest_and_allocate_slots() {
        let query = parse(
            "bbox(0,0,1,1).ways{ .nodes{ amenity=bench } AND .relations{ seats=3 } }",
        )
        .unwrap();
        let statement = &query.statements[0];
        assert_eq!(statement.slots, 2);
        let FilterExpr::And(left, right) = &statement.filter else { panic!("expected an AND") };
        let (FilterExpr::Sub(first), FilterExpr::Sub(second)) = (left.as_ref(), right.as_ref())
        else {
            panic!("expected two sub-statements")
        };
        assert_eq!((first.slot, second.slot), (0, 1));
        assert_eq!(first.query_type, QueryType::Nodes);
        assert_eq!(second.query_type, QueryType::Relations);
    }

    #[test]
    fn invalid_pairing_is_a_semantic_error() {
        assert!(matches!(
            parse("bbox(0,0,1,1).nodes{ .nodes{ amenity=bench } }"),
            Err(Error::QuerySemantics(_))
        ));
        assert!(matches!(
            parse("bbox(0,0,1,1).ways{ .child_relations{ amenity=bench } }"),
            Err(Error::QuerySemantics(_))
        ));
        assert!(parse("bbox(0,0,1,1).relations{ .child_relations{ amenity=bench } }").is_ok());
    }

    #[test]
    fn errors_carry_the_position() {
        let Err(Error::QuerySyntax { position, .. }) = parse("bbox(0,0,1,1).nodes{ amenity ? }")
        else {
            panic!("expected a syntax error")
        };
        assert_eq!(position, 29);

        let Err(Error::QuerySyntax { position, .. }) = parse("bbox(0,0,1,1).towers{ a=b }") else {
            panic!("expected a syntax error")
        };
        assert_eq!(position, 14);
    }

    #[test]
    fn multiple_statements() {
        let query = parse(
            "bbox(0,0,1,1).nodes{ amenity=bench }\n\
             bbox(2,2,3,3).ways{ seats>=2 }",
        )
        .unwrap();
        assert_eq!(query.statements.len(), 2);
    }
}

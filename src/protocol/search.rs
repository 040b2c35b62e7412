//! Search expressions
//!
//! Compiles a user query plus optional constraints into the flattened
//! prefix-order entry vector the server search opcode carries. Bare
//! terms conjoin with implicit ANDs; quoted strings are never keywords;
//! parentheses group subexpressions.

use anyhow::Result;
use bytes::{BufMut, BytesMut};

use crate::error::{Ed2kError, ErrorKind};
use crate::protocol::tag::{get_u64, get_u8, put_string_u16, read_string_u16};
use crate::protocol::{ft, MAX_COLLECTION_SIZE};

/// Longest accepted operand string.
const MAX_TERM_LEN: usize = 20;
/// Cap on flattened entries per request.
const MAX_ENTRIES: usize = 30;

// wire markers for entry kinds
const ENTRY_OPERATOR: u8 = 0x00;
const ENTRY_TERM: u8 = 0x01;
const ENTRY_META_STRING: u8 = 0x02;
const ENTRY_META_NUMERIC: u8 = 0x03;

/// Numeric comparison selectors.
pub const SEARCH_OP_EQUAL: u8 = 0;
pub const SEARCH_OP_GREATER: u8 = 1;
pub const SEARCH_OP_LESS: u8 = 2;

// file type strings used in type constraints
pub const ED2KFTSTR_AUDIO: &str = "Audio";
pub const ED2KFTSTR_VIDEO: &str = "Video";
pub const ED2KFTSTR_IMAGE: &str = "Image";
pub const ED2KFTSTR_DOCUMENT: &str = "Doc";
pub const ED2KFTSTR_PROGRAM: &str = "Pro";
pub const ED2KFTSTR_ARCHIVE: &str = "Arc";
pub const ED2KFTSTR_CDIMAGE: &str = "Iso";
pub const ED2KFTSTR_EMULECOLLECTION: &str = "EmuleCollection";
pub const ED2KFTSTR_FOLDER: &str = "Folder";
pub const ED2KFTSTR_USER: &str = "User";

/// Term standing in for "any user nick" in user searches.
const USER_NICK_SENTINEL: &str = "'+++USERNICK+++'";
/// Shared-directory prefix matched by folder searches.
const FOLDER_PREFIX_SENTINEL: &str = "ED2K:\\";

/// Logical connective between two subtrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOp {
    And,
    Or,
    Not,
}

impl SearchOp {
    fn wire_value(self) -> u8 {
        match self {
            SearchOp::And => 0x00,
            SearchOp::Or => 0x01,
            SearchOp::Not => 0x02,
        }
    }

    fn from_wire(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(SearchOp::And),
            0x01 => Ok(SearchOp::Or),
            0x02 => Ok(SearchOp::Not),
            _ => Err(Ed2kError::decode_error(ErrorKind::DecodePacketError).into()),
        }
    }
}

/// One entry of the flattened prefix-order request.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchEntry {
    Operator(SearchOp),
    Term(String),
    MetaString { value: String, tag: u8 },
    MetaNumeric { value: u64, op: u8, tag: u8 },
}

/// A compiled search request: operators precede their operands.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchRequest(pub Vec<SearchEntry>);

impl SearchRequest {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize for the SEARCHREQUEST body.
    pub fn write(&self, buf: &mut BytesMut) {
        for entry in &self.0 {
            match entry {
                SearchEntry::Operator(op) => {
                    buf.put_u8(ENTRY_OPERATOR);
                    buf.put_u8(op.wire_value());
                }
                SearchEntry::Term(value) => {
                    buf.put_u8(ENTRY_TERM);
                    put_string_u16(buf, value);
                }
                SearchEntry::MetaString { value, tag } => {
                    buf.put_u8(ENTRY_META_STRING);
                    put_string_u16(buf, value);
                    buf.put_u8(*tag);
                }
                SearchEntry::MetaNumeric { value, op, tag } => {
                    buf.put_u8(ENTRY_META_NUMERIC);
                    buf.put_u64_le(*value);
                    buf.put_u8(*op);
                    buf.put_u8(*tag);
                }
            }
        }
    }

    /// Decode a SEARCHREQUEST body.
    pub fn read(buf: &mut BytesMut) -> Result<SearchRequest> {
        let mut entries = Vec::new();
        while !buf.is_empty() {
            if entries.len() > MAX_COLLECTION_SIZE {
                return Err(Ed2kError::decode_error(ErrorKind::DecodePacketError).into());
            }
            let kind = get_u8(buf)?;
            let entry = match kind {
                ENTRY_OPERATOR => SearchEntry::Operator(SearchOp::from_wire(get_u8(buf)?)?),
                ENTRY_TERM => SearchEntry::Term(read_string_u16(buf)?),
                ENTRY_META_STRING => {
                    let value = read_string_u16(buf)?;
                    let tag = get_u8(buf)?;
                    SearchEntry::MetaString { value, tag }
                }
                ENTRY_META_NUMERIC => {
                    let value = get_u64(buf)?;
                    let op = get_u8(buf)?;
                    let tag = get_u8(buf)?;
                    SearchEntry::MetaNumeric { value, op, tag }
                }
                k => {
                    return Err(Ed2kError::decode_error_with(
                        ErrorKind::DecodePacketError,
                        format!("unknown search entry kind: 0x{:02X}", k),
                    )
                    .into())
                }
            };
            entries.push(entry);
        }
        Ok(SearchRequest(entries))
    }
}

/// Optional constraints conjoined in front of the query tree.
#[derive(Debug, Clone, Default)]
pub struct SearchConstraints {
    pub min_size: u64,
    pub max_size: u64,
    pub sources_count: u32,
    pub complete_sources_count: u32,
    pub file_type: String,
    pub file_extension: String,
    pub codec: String,
    pub media_length: u32,
    pub media_bitrate: u32,
}

/// Well-known sources-count tag id used only by search constraints.
const FT_SOURCES: u8 = 0x15;

impl SearchConstraints {
    fn nodes(&self) -> Result<Vec<Node>> {
        let mut out = Vec::new();
        match self.file_type.as_str() {
            "" => {}
            ED2KFTSTR_USER => {
                // user searches match on the nick sentinel, not a type tag
                out.push(Node::Leaf(SearchEntry::Term(USER_NICK_SENTINEL.to_string())));
            }
            ED2KFTSTR_FOLDER => {
                // folder searches exclude collections and match the
                // shared-directory prefix
                out.push(Node::Op(
                    SearchOp::Not,
                    Box::new(Node::Leaf(SearchEntry::MetaString {
                        value: ED2KFTSTR_EMULECOLLECTION.to_string(),
                        tag: ft::FT_FILETYPE,
                    })),
                    Box::new(Node::Leaf(SearchEntry::Term(FOLDER_PREFIX_SENTINEL.to_string()))),
                ));
            }
            other => {
                check_term(other)?;
                // archives and cd images are indexed under the program type
                let value = if other == ED2KFTSTR_ARCHIVE || other == ED2KFTSTR_CDIMAGE {
                    ED2KFTSTR_PROGRAM
                } else {
                    other
                };
                out.push(Node::Leaf(SearchEntry::MetaString {
                    value: value.to_string(),
                    tag: ft::FT_FILETYPE,
                }));
            }
        }
        if self.min_size > 0 {
            out.push(Node::Leaf(SearchEntry::MetaNumeric {
                value: self.min_size,
                op: SEARCH_OP_GREATER,
                tag: ft::FT_FILESIZE,
            }));
        }
        if self.max_size > 0 {
            out.push(Node::Leaf(SearchEntry::MetaNumeric {
                value: self.max_size,
                op: SEARCH_OP_LESS,
                tag: ft::FT_FILESIZE,
            }));
        }
        if self.sources_count > 0 {
            out.push(Node::Leaf(SearchEntry::MetaNumeric {
                value: self.sources_count as u64,
                op: SEARCH_OP_GREATER,
                tag: FT_SOURCES,
            }));
        }
        if self.complete_sources_count > 0 {
            out.push(Node::Leaf(SearchEntry::MetaNumeric {
                value: self.complete_sources_count as u64,
                op: SEARCH_OP_GREATER,
                tag: ft::FT_COMPLETE_SOURCES,
            }));
        }
        if !self.file_extension.is_empty() {
            check_term(&self.file_extension)?;
            out.push(Node::Leaf(SearchEntry::MetaString {
                value: self.file_extension.clone(),
                tag: ft::FT_FILEFORMAT,
            }));
        }
        if !self.codec.is_empty() {
            check_term(&self.codec)?;
            out.push(Node::Leaf(SearchEntry::MetaString {
                value: self.codec.clone(),
                tag: ft::FT_MEDIA_CODEC,
            }));
        }
        if self.media_length > 0 {
            out.push(Node::Leaf(SearchEntry::MetaNumeric {
                value: self.media_length as u64,
                op: SEARCH_OP_GREATER,
                tag: ft::FT_MEDIA_LENGTH,
            }));
        }
        if self.media_bitrate > 0 {
            out.push(Node::Leaf(SearchEntry::MetaNumeric {
                value: self.media_bitrate as u64,
                op: SEARCH_OP_GREATER,
                tag: ft::FT_MEDIA_BITRATE,
            }));
        }
        Ok(out)
    }
}

fn check_term(term: &str) -> Result<()> {
    if term.len() > MAX_TERM_LEN {
        return Err(Ed2kError::search_error(ErrorKind::InputStringTooLarge).into());
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word { text: String, quoted: bool },
    Open,
    Close,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf(SearchEntry),
    Op(SearchOp, Box<Node>, Box<Node>),
}

impl Node {
    fn flatten(&self, out: &mut Vec<SearchEntry>) {
        match self {
            Node::Leaf(entry) => out.push(entry.clone()),
            Node::Op(op, left, right) => {
                out.push(SearchEntry::Operator(*op));
                left.flatten(out);
                right.flatten(out);
            }
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut current_quoted = false;
    let mut in_quote = false;
    let mut depth = 0i32;

    let flush = |tokens: &mut Vec<Token>, current: &mut String, quoted: &mut bool| {
        if !current.is_empty() {
            tokens.push(Token::Word {
                text: std::mem::take(current),
                quoted: *quoted,
            });
        }
        *quoted = false;
    };

    for ch in input.chars() {
        if in_quote {
            if ch == '"' {
                in_quote = false;
                current_quoted = true;
            } else {
                current.push(ch);
            }
            continue;
        }
        match ch {
            '"' => in_quote = true,
            '(' => {
                flush(&mut tokens, &mut current, &mut current_quoted);
                depth += 1;
                tokens.push(Token::Open);
            }
            ')' => {
                flush(&mut tokens, &mut current, &mut current_quoted);
                depth -= 1;
                if depth < 0 {
                    return Err(Ed2kError::search_error(ErrorKind::IncorrectBracketsCount).into());
                }
                tokens.push(Token::Close);
            }
            c if c.is_whitespace() => flush(&mut tokens, &mut current, &mut current_quoted),
            c => current.push(c),
        }
    }

    if in_quote {
        return Err(Ed2kError::search_error(ErrorKind::UnclosedQuotationMark).into());
    }
    if depth != 0 {
        return Err(Ed2kError::search_error(ErrorKind::IncorrectBracketsCount).into());
    }
    flush(&mut tokens, &mut current, &mut current_quoted);
    Ok(tokens)
}

fn keyword_op(token: &Token) -> Option<SearchOp> {
    match token {
        Token::Word { text, quoted: false } => match text.as_str() {
            "AND" => Some(SearchOp::And),
            "OR" => Some(SearchOp::Or),
            "NOT" => Some(SearchOp::Not),
            _ => None,
        },
        _ => None,
    }
}

fn parse_operand(tokens: &[Token], pos: &mut usize) -> Result<Node> {
    match tokens.get(*pos) {
        Some(Token::Open) => {
            *pos += 1;
            let node = parse_expr(tokens, pos, None)?;
            match tokens.get(*pos) {
                Some(Token::Close) => {
                    *pos += 1;
                    Ok(node)
                }
                _ => Err(Ed2kError::search_error(ErrorKind::IncorrectBracketsCount).into()),
            }
        }
        Some(Token::Word { text, .. }) => {
            check_term(text)?;
            *pos += 1;
            Ok(Node::Leaf(SearchEntry::Term(text.clone())))
        }
        _ => Err(Ed2kError::search_error(ErrorKind::OperatorIncorrectPlace).into()),
    }
}

/// Left-fold parse: each operator joins the tree built so far with the
/// next operand, so `a b c` becomes `AND(AND(a, b), c)`.
fn parse_expr(tokens: &[Token], pos: &mut usize, seed: Option<Node>) -> Result<Node> {
    let mut left = seed;

    loop {
        match tokens.get(*pos) {
            None | Some(Token::Close) => break,
            Some(token) => {
                if let Some(op) = keyword_op(token) {
                    let lhs = left.ok_or_else(|| {
                        anyhow::Error::from(Ed2kError::search_error(ErrorKind::OperatorIncorrectPlace))
                    })?;
                    *pos += 1;
                    if tokens.get(*pos).map(keyword_op).flatten().is_some() {
                        return Err(Ed2kError::search_error(ErrorKind::OperatorIncorrectPlace).into());
                    }
                    let rhs = parse_operand(tokens, pos)?;
                    left = Some(Node::Op(op, Box::new(lhs), Box::new(rhs)));
                } else {
                    let operand = parse_operand(tokens, pos)?;
                    left = Some(match left {
                        None => operand,
                        Some(lhs) => Node::Op(SearchOp::And, Box::new(lhs), Box::new(operand)),
                    });
                }
            }
        }
    }

    left.ok_or_else(|| anyhow::Error::from(Ed2kError::search_error(ErrorKind::EmptyBrackets)))
}

/// Compile `query` plus `constraints` into a flattened search request.
///
/// Constraint entries conjoin in front of the query tree. A query that
/// opens with an operator is accepted only when constraints supply the
/// left operand, matching classic client behavior.
pub fn compile_search(constraints: &SearchConstraints, query: &str) -> Result<SearchRequest> {
    let constraint_nodes = constraints.nodes()?;
    let tokens = tokenize(query)?;

    let mut pos = 0usize;
    let tree = if tokens.is_empty() {
        constraint_chain(&constraint_nodes, None)
            .ok_or_else(|| anyhow::Error::from(Ed2kError::search_error(ErrorKind::OperatorIncorrectPlace)))?
    } else if keyword_op(&tokens[0]).is_some() && !constraint_nodes.is_empty() {
        // constraints stand in as the first operand
        let seed = constraint_chain(&constraint_nodes, None).unwrap();
        let tree = parse_expr(&tokens, &mut pos, Some(seed))?;
        check_consumed(&tokens, pos)?;
        tree
    } else {
        let query_tree = parse_expr(&tokens, &mut pos, None)?;
        check_consumed(&tokens, pos)?;
        constraint_chain(&constraint_nodes, Some(query_tree)).unwrap()
    };

    let mut entries = Vec::new();
    tree.flatten(&mut entries);
    if entries.len() > MAX_ENTRIES {
        return Err(Ed2kError::search_error(ErrorKind::SearchExpressionTooComplex).into());
    }
    Ok(SearchRequest(entries))
}

fn check_consumed(tokens: &[Token], pos: usize) -> Result<()> {
    if pos != tokens.len() {
        return Err(Ed2kError::search_error(ErrorKind::IncorrectBracketsCount).into());
    }
    Ok(())
}

/// Right-nest constraint subtrees over an optional tail tree:
/// `AND(c1, AND(c2, tail))`.
fn constraint_chain(constraints: &[Node], tail: Option<Node>) -> Option<Node> {
    let mut node = tail;
    for constraint in constraints.iter().rev() {
        node = Some(match node {
            None => constraint.clone(),
            Some(rest) => Node::Op(SearchOp::And, Box::new(constraint.clone()), Box::new(rest)),
        });
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(query: &str) -> SearchRequest {
        compile_search(&SearchConstraints::default(), query).unwrap()
    }

    fn compile_err(query: &str) -> ErrorKind {
        compile_search(&SearchConstraints::default(), query)
            .unwrap_err()
            .downcast::<Ed2kError>()
            .unwrap()
            .kind()
    }

    fn term(s: &str) -> SearchEntry {
        SearchEntry::Term(s.to_string())
    }

    fn op(o: SearchOp) -> SearchEntry {
        SearchEntry::Operator(o)
    }

    #[test]
    fn test_implicit_and_pair() {
        let request = compile("a b");
        assert_eq!(request.0, vec![op(SearchOp::And), term("a"), term("b")]);
    }

    #[test]
    fn test_brackets_left_fold() {
        // (a b) c d => AND(AND(AND(a, b), c), d)
        let request = compile("(a b) c d");
        assert_eq!(
            request.0,
            vec![
                op(SearchOp::And),
                op(SearchOp::And),
                op(SearchOp::And),
                term("a"),
                term("b"),
                term("c"),
                term("d"),
            ]
        );
    }

    #[test]
    fn test_redundant_brackets_collapse() {
        assert_eq!(compile("(((a b)))(c)(d)").0, compile("(a b) c d").0);
        assert_eq!(compile("(((a AND b)))AND((c))AND((d))").0, compile("(a b) c d").0);
    }

    #[test]
    fn test_explicit_or() {
        let request = compile("X1 OR X2");
        assert_eq!(request.0, vec![op(SearchOp::Or), term("X1"), term("X2")]);
    }

    #[test]
    fn test_quoted_keyword_is_operand() {
        let request = compile("X1 \"AND\"");
        assert_eq!(request.0, vec![op(SearchOp::And), term("X1"), term("AND")]);
    }

    #[test]
    fn test_lowercase_keywords_are_operands() {
        let request = compile("X1 and X2");
        assert_eq!(
            request.0,
            vec![op(SearchOp::And), op(SearchOp::And), term("X1"), term("and"), term("X2")]
        );
    }

    #[test]
    fn test_quote_fragments_concatenate() {
        let request = compile("\"M\"M\"M\"");
        assert_eq!(request.0, vec![term("MMM")]);
    }

    #[test]
    fn test_quoted_string_keeps_spaces() {
        let request = compile("X1 \"AND   \"");
        assert_eq!(request.0, vec![op(SearchOp::And), term("X1"), term("AND   ")]);
    }

    #[test]
    fn test_incorrect_expressions() {
        assert_eq!(compile_err(") A"), ErrorKind::IncorrectBracketsCount);
        assert_eq!(compile_err("(( A)"), ErrorKind::IncorrectBracketsCount);
        assert_eq!(compile_err("(((A))("), ErrorKind::IncorrectBracketsCount);
        assert_eq!(compile_err("(A)AND"), ErrorKind::OperatorIncorrectPlace);
        assert_eq!(compile_err("X1 AND"), ErrorKind::OperatorIncorrectPlace);
        assert_eq!(compile_err("AND X1"), ErrorKind::OperatorIncorrectPlace);
        assert_eq!(compile_err("X1 AND OR DATA"), ErrorKind::OperatorIncorrectPlace);
        assert_eq!(compile_err("AND"), ErrorKind::OperatorIncorrectPlace);
        assert_eq!(compile_err("X1 NOT"), ErrorKind::OperatorIncorrectPlace);
        assert_eq!(compile_err("X1 \"DATA   "), ErrorKind::UnclosedQuotationMark);
        assert_eq!(compile_err("X1 \"AND\"\"DATA"), ErrorKind::UnclosedQuotationMark);
        assert_eq!(compile_err("()"), ErrorKind::EmptyBrackets);
    }

    #[test]
    fn test_file_type_conjoins_or_subtree() {
        let constraints = SearchConstraints {
            file_type: "Pro".to_string(),
            ..Default::default()
        };
        let request = compile_search(&constraints, "X1 OR X2").unwrap();
        assert_eq!(
            request.0,
            vec![
                op(SearchOp::And),
                SearchEntry::MetaString {
                    value: "Pro".to_string(),
                    tag: ft::FT_FILETYPE,
                },
                op(SearchOp::Or),
                term("X1"),
                term("X2"),
            ]
        );
    }

    #[test]
    fn test_numeric_constraints_chain() {
        let constraints = SearchConstraints {
            min_size: 10,
            max_size: 300,
            ..Default::default()
        };
        let request = compile_search(&constraints, "kad").unwrap();
        assert_eq!(
            request.0,
            vec![
                op(SearchOp::And),
                SearchEntry::MetaNumeric {
                    value: 10,
                    op: SEARCH_OP_GREATER,
                    tag: ft::FT_FILESIZE,
                },
                op(SearchOp::And),
                SearchEntry::MetaNumeric {
                    value: 300,
                    op: SEARCH_OP_LESS,
                    tag: ft::FT_FILESIZE,
                },
                term("kad"),
            ]
        );
    }

    #[test]
    fn test_leading_operator_allowed_with_constraints() {
        let constraints = SearchConstraints {
            file_type: "Audio".to_string(),
            ..Default::default()
        };
        let request = compile_search(&constraints, "NOT X1").unwrap();
        assert_eq!(
            request.0,
            vec![
                op(SearchOp::Not),
                SearchEntry::MetaString {
                    value: "Audio".to_string(),
                    tag: ft::FT_FILETYPE,
                },
                term("X1"),
            ]
        );
    }

    #[test]
    fn test_user_search_injects_nick_sentinel() {
        let constraints = SearchConstraints {
            file_type: ED2KFTSTR_USER.to_string(),
            ..Default::default()
        };
        let request = compile_search(&constraints, "X1 X2").unwrap();
        assert_eq!(
            request.0,
            vec![
                op(SearchOp::And),
                term("'+++USERNICK+++'"),
                op(SearchOp::And),
                term("X1"),
                term("X2"),
            ]
        );
    }

    #[test]
    fn test_folder_search_excludes_collections() {
        let constraints = SearchConstraints {
            file_type: ED2KFTSTR_FOLDER.to_string(),
            ..Default::default()
        };
        let request = compile_search(&constraints, "X1").unwrap();
        assert_eq!(
            request.0,
            vec![
                op(SearchOp::And),
                op(SearchOp::Not),
                SearchEntry::MetaString {
                    value: ED2KFTSTR_EMULECOLLECTION.to_string(),
                    tag: ft::FT_FILETYPE,
                },
                term("ED2K:\\"),
                term("X1"),
            ]
        );
    }

    #[test]
    fn test_leading_operator_allowed_with_user_type() {
        // the sentinel term supplies the left operand, so no AND is
        // required after it
        let constraints = SearchConstraints {
            min_size: 40,
            max_size: 70,
            sources_count: 20,
            file_type: ED2KFTSTR_USER.to_string(),
            ..Default::default()
        };
        assert!(compile_search(&constraints, "AND X1").is_ok());
    }

    #[test]
    fn test_cd_image_searches_program_type() {
        for raw in [ED2KFTSTR_CDIMAGE, ED2KFTSTR_ARCHIVE] {
            let constraints = SearchConstraints {
                file_type: raw.to_string(),
                ..Default::default()
            };
            let request = compile_search(&constraints, "X1").unwrap();
            assert_eq!(
                request.0[1],
                SearchEntry::MetaString {
                    value: ED2KFTSTR_PROGRAM.to_string(),
                    tag: ft::FT_FILETYPE,
                }
            );
        }
    }

    #[test]
    fn test_term_too_long_rejected() {
        let constraints = SearchConstraints {
            file_extension: "1234567890122345678900000".to_string(),
            ..Default::default()
        };
        let err = compile_search(&constraints, "X1").unwrap_err();
        assert_eq!(err.downcast::<Ed2kError>().unwrap().kind(), ErrorKind::InputStringTooLarge);
    }

    #[test]
    fn test_too_complex_rejected() {
        let query = "X1 X2 X3 x4 x5 x6 x7 x8 x9 x10 x11 x12 x13 x14 x15 y z d NOT K";
        assert_eq!(compile_err(query), ErrorKind::SearchExpressionTooComplex);
    }

    #[test]
    fn test_wire_round_trip() {
        let constraints = SearchConstraints {
            min_size: 10,
            file_type: "Video".to_string(),
            ..Default::default()
        };
        let request = compile_search(&constraints, "a b OR c").unwrap();
        let mut buf = BytesMut::new();
        request.write(&mut buf);
        let decoded = SearchRequest::read(&mut buf).unwrap();
        assert_eq!(decoded, request);
    }
}

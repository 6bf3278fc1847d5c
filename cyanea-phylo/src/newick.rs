//! Newick format parser and writer.
//!
//! Grammar, with BEAST-style bracket comments:
//! ```text
//! tree     = subtree ';'
//! subtree  = '(' children ')' label | label
//! children = subtree (',' subtree)*
//! label    = name? comment? (':' comment? length comment?)?
//! name     = bare | "'" quoted "'"
//! comment  = '[' text ']'
//! ```
//!
//! A comment of the form `[&rate=1.25]` (keys may be combined, e.g.
//! `[&rate=1.25,height=3]`) sets [`Node::rate`]; other comments are skipped.

use crate::tree::{Node, NodeId, PhyloTree};
use cyanea_core::{CyaneaError, Result};

/// Parse a Newick format string into a `PhyloTree`.
pub fn parse(input: &str) -> Result<PhyloTree> {
    let mut parser = Parser::new(input.as_bytes());
    let root = parser.parse_tree()?;
    PhyloTree::from_nodes(parser.nodes, root)
}

/// Serialize a `PhyloTree` to a Newick format string.
///
/// Branch rates are written back as `[&rate=..]` annotations.
pub fn write(tree: &PhyloTree) -> String {
    let mut buf = String::new();
    write_subtree(tree, tree.root(), &mut buf);
    buf.push(';');
    buf
}

fn write_subtree(tree: &PhyloTree, id: NodeId, buf: &mut String) {
    let Some(node) = tree.get_node(id) else {
        return;
    };
    if !node.children.is_empty() {
        buf.push('(');
        for (i, &child) in node.children.iter().enumerate() {
            if i > 0 {
                buf.push(',');
            }
            write_subtree(tree, child, buf);
        }
        buf.push(')');
    }
    if let Some(ref name) = node.name {
        if name.bytes().any(needs_quoting) {
            buf.push('\'');
            buf.push_str(&name.replace('\'', "''"));
            buf.push('\'');
        } else {
            buf.push_str(name);
        }
    }
    if let Some(rate) = node.rate {
        buf.push_str("[&rate=");
        buf.push_str(&format_number(rate));
        buf.push(']');
    }
    if let Some(len) = node.branch_length {
        buf.push(':');
        buf.push_str(&format_number(len));
    }
}

fn format_number(x: f64) -> String {
    let s = format!("{:.10}", x);
    let s = s.trim_end_matches('0');
    s.trim_end_matches('.').to_string()
}

fn needs_quoting(b: u8) -> bool {
    matches!(
        b,
        b':' | b',' | b')' | b'(' | b';' | b'[' | b']' | b'\'' | b' ' | b'\t' | b'\n' | b'\r'
    )
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<Node>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            nodes: Vec::new(),
        }
    }

    fn error(&self, what: &str) -> CyaneaError {
        CyaneaError::Parse(format!("{} at byte {}", what, self.pos))
    }

    fn parse_tree(&mut self) -> Result<NodeId> {
        let root = self.parse_subtree(None)?;
        self.skip_trivia()?;
        if self.peek() != Some(b';') {
            return Err(self.error("expected ';' at end of Newick string"));
        }
        self.pos += 1;
        Ok(root)
    }

    fn parse_subtree(&mut self, parent: Option<NodeId>) -> Result<NodeId> {
        self.skip_trivia()?;
        let id = self.alloc_node(parent);

        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                let child = self.parse_subtree(Some(id))?;
                self.nodes[id].children.push(child);
                self.skip_trivia()?;
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("expected ',' or ')' in Newick string")),
                }
            }
        }

        self.parse_label(id)?;
        Ok(id)
    }

    fn parse_label(&mut self, id: NodeId) -> Result<()> {
        self.skip_whitespace();
        let name = if self.peek() == Some(b'\'') {
            self.parse_quoted()?
        } else {
            self.parse_bare()
        };
        if !name.is_empty() {
            self.nodes[id].name = Some(name);
        }
        self.skip_annotations(id)?;
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_annotations(id)?;
            let start = self.pos;
            while matches!(
                self.peek(),
                Some(b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E')
            ) {
                self.pos += 1;
            }
            let text = String::from_utf8_lossy(&self.input[start..self.pos]);
            if text.is_empty() {
                return Err(self.error("expected number after ':'"));
            }
            let len: f64 = text.parse().map_err(|_| {
                CyaneaError::Parse(format!("invalid branch length '{}' at byte {}", text, start))
            })?;
            self.nodes[id].branch_length = Some(len);
            self.skip_annotations(id)?;
        }
        Ok(())
    }

    fn parse_bare(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if needs_quoting(b) {
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn parse_quoted(&mut self) -> Result<String> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated quoted label")),
                Some(b'\'') if self.input.get(self.pos + 1) == Some(&b'\'') => {
                    out.push(b'\'');
                    self.pos += 2;
                }
                Some(b'\'') => {
                    self.pos += 1;
                    break;
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Skip whitespace and bracket comments, applying `&key=value` pairs to `id`.
    fn skip_annotations(&mut self, id: NodeId) -> Result<()> {
        loop {
            self.skip_whitespace();
            if self.peek() != Some(b'[') {
                return Ok(());
            }
            let body = self.read_comment()?;
            if let Some(pairs) = body.strip_prefix('&') {
                for pair in pairs.split(',') {
                    let Some((key, value)) = pair.split_once('=') else {
                        continue;
                    };
                    if key.trim() == "rate" {
                        let rate: f64 = value.trim().parse().map_err(|_| {
                            self.error(&format!("invalid rate annotation '{}'", value))
                        })?;
                        self.nodes[id].rate = Some(rate);
                    }
                }
            }
        }
    }

    fn read_comment(&mut self) -> Result<String> {
        let start = self.pos + 1;
        while let Some(b) = self.peek() {
            self.pos += 1;
            if b == b']' {
                return Ok(String::from_utf8_lossy(&self.input[start..self.pos - 1]).into_owned());
            }
        }
        Err(self.error("unterminated '[' comment"))
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            self.skip_whitespace();
            if self.peek() != Some(b'[') {
                return Ok(());
            }
            self.read_comment()?;
        }
    }

    fn alloc_node(&mut self, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            parent,
            children: Vec::new(),
            branch_length: None,
            rate: None,
            name: None,
        });
        id
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }
}

// portflow/src/document/query.rs

//! A small path language over [`Document`] trees, used by the default engine.
//!
//! Supported: string and number literals, `$variables`, absolute (`/`), relative and
//! descendant (`//`) paths with `.`, `..`, `*`, `name`, `prefix:name`, `prefix:*`, `@attr`,
//! `@*`, `text()` and `node()` steps, predicates (`[2]`, `[@id = 'x']`), unions (`|`),
//! `=` and `!=`, `and`, `or` and a handful of functions.
//!
//! Unprefixed name tests match on the local name alone; prefixed ones also require the
//! node's prefix to be the same.

use super::engine::{format_number, Item, QueryContext};
use super::node::{Document, NodeKind};
use anyhow::{anyhow, bail, Result};
use std::collections::HashSet;

#[derive(Clone, Debug, PartialEq)]
enum Token {
  Slash,
  DoubleSlash,
  Dot,
  DotDot,
  At,
  Star,
  LBracket,
  RBracket,
  LParen,
  RParen,
  Comma,
  Pipe,
  Equal,
  NotEqual,
  Name { prefix: Option<String>, local: String },
  Variable { prefix: Option<String>, local: String },
  String(String),
  Number(f64),
}

fn is_name_start(c: char) -> bool {
  c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
  c.is_alphanumeric() || c == '_' || c == '-' || c == '.'
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
  let chars: Vec<char> = input.chars().collect();
  let mut tokens = Vec::new();
  let mut i = 0;

  let read_ncname = |start: usize| -> (String, usize) {
    let mut end = start;
    while end < chars.len() && is_name_char(chars[end]) {
      end += 1;
    }
    (chars[start..end].iter().collect(), end)
  };

  // Reads `local`, `prefix:local` or `prefix:*` starting at `start`.
  let read_qname = |start: usize| -> (Option<String>, String, usize) {
    let (first, end) = read_ncname(start);
    if end + 1 < chars.len() && chars[end] == ':' {
      if chars[end + 1] == '*' {
        return (Some(first), "*".to_string(), end + 2);
      }
      if is_name_start(chars[end + 1]) {
        let (local, after) = read_ncname(end + 1);
        return (Some(first), local, after);
      }
    }
    (None, first, end)
  };

  while i < chars.len() {
    let c = chars[i];
    let next = chars.get(i + 1).copied();
    match c {
      c if c.is_whitespace() => i += 1,
      '/' if next == Some('/') => {
        tokens.push(Token::DoubleSlash);
        i += 2;
      }
      '/' => {
        tokens.push(Token::Slash);
        i += 1;
      }
      '.' if next == Some('.') => {
        tokens.push(Token::DotDot);
        i += 2;
      }
      '.' if next.map_or(false, |n| n.is_ascii_digit()) => {
        let start = i;
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
          i += 1;
        }
        let text: String = chars[start..i].iter().collect();
        tokens.push(Token::Number(text.parse()?));
      }
      '.' => {
        tokens.push(Token::Dot);
        i += 1;
      }
      '@' => {
        tokens.push(Token::At);
        i += 1;
      }
      '*' => {
        tokens.push(Token::Star);
        i += 1;
      }
      '[' => {
        tokens.push(Token::LBracket);
        i += 1;
      }
      ']' => {
        tokens.push(Token::RBracket);
        i += 1;
      }
      '(' => {
        tokens.push(Token::LParen);
        i += 1;
      }
      ')' => {
        tokens.push(Token::RParen);
        i += 1;
      }
      ',' => {
        tokens.push(Token::Comma);
        i += 1;
      }
      '|' => {
        tokens.push(Token::Pipe);
        i += 1;
      }
      '=' => {
        tokens.push(Token::Equal);
        i += 1;
      }
      '!' if next == Some('=') => {
        tokens.push(Token::NotEqual);
        i += 2;
      }
      '\'' | '"' => {
        let quote = c;
        let start = i + 1;
        let mut end = start;
        while end < chars.len() && chars[end] != quote {
          end += 1;
        }
        if end >= chars.len() {
          bail!("Unterminated string literal starting at offset {}", i);
        }
        tokens.push(Token::String(chars[start..end].iter().collect()));
        i = end + 1;
      }
      '$' => {
        if !next.map_or(false, is_name_start) {
          bail!("Expected a variable name after '$' at offset {}", i);
        }
        let (prefix, local, end) = read_qname(i + 1);
        tokens.push(Token::Variable { prefix, local });
        i = end;
      }
      c if c.is_ascii_digit() => {
        let start = i;
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
          i += 1;
        }
        let text: String = chars[start..i].iter().collect();
        tokens.push(Token::Number(text.parse()?));
      }
      c if is_name_start(c) => {
        let (prefix, local, end) = read_qname(i);
        tokens.push(Token::Name { prefix, local });
        i = end;
      }
      _ => bail!("Unexpected character '{}' at offset {}", c, i),
    }
  }
  Ok(tokens)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Axis {
  Child,
  Attribute,
  DescendantOrSelf,
  SelfNode,
  Parent,
}

#[derive(Clone, Debug, PartialEq)]
enum NodeTest {
  Name { prefix: Option<String>, local: String },
  AnyName { prefix: Option<String> },
  Text,
  Node,
}

#[derive(Clone, Debug)]
struct PathStep {
  axis: Axis,
  test: NodeTest,
  predicates: Vec<Expr>,
}

#[derive(Clone, Debug)]
enum PathStart {
  Root,
  Context,
  Expr(Box<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Comparison {
  Equal,
  NotEqual,
}

#[derive(Clone, Debug)]
enum Expr {
  String(String),
  Number(f64),
  Variable { prefix: Option<String>, local: String },
  Function { name: String, args: Vec<Expr> },
  Filter { primary: Box<Expr>, predicates: Vec<Expr> },
  Path { start: PathStart, steps: Vec<PathStep> },
  Union(Box<Expr>, Box<Expr>),
  Compare(Comparison, Box<Expr>, Box<Expr>),
  And(Box<Expr>, Box<Expr>),
  Or(Box<Expr>, Box<Expr>),
}

struct Parser {
  tokens: Vec<Token>,
  pos: usize,
}

impl Parser {
  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn peek_at(&self, offset: usize) -> Option<&Token> {
    self.tokens.get(self.pos + offset)
  }

  fn advance(&mut self) -> Option<Token> {
    let token = self.tokens.get(self.pos).cloned();
    self.pos += 1;
    token
  }

  fn expect(&mut self, expected: Token) -> Result<()> {
    match self.advance() {
      Some(token) if token == expected => Ok(()),
      Some(token) => bail!("Expected {:?}, found {:?}", expected, token),
      None => bail!("Expected {:?}, found end of query", expected),
    }
  }

  fn at_keyword(&self, keyword: &str) -> bool {
    matches!(self.peek(), Some(Token::Name { prefix: None, local }) if local == keyword)
  }

  fn parse(mut self) -> Result<Expr> {
    let expr = self.parse_or()?;
    match self.peek() {
      None => Ok(expr),
      Some(token) => bail!("Unexpected {:?} after end of expression", token),
    }
  }

  fn parse_or(&mut self) -> Result<Expr> {
    let mut left = self.parse_and()?;
    while self.at_keyword("or") {
      self.advance();
      let right = self.parse_and()?;
      left = Expr::Or(Box::new(left), Box::new(right));
    }
    Ok(left)
  }

  fn parse_and(&mut self) -> Result<Expr> {
    let mut left = self.parse_comparison()?;
    while self.at_keyword("and") {
      self.advance();
      let right = self.parse_comparison()?;
      left = Expr::And(Box::new(left), Box::new(right));
    }
    Ok(left)
  }

  fn parse_comparison(&mut self) -> Result<Expr> {
    let left = self.parse_union()?;
    let op = match self.peek() {
      Some(Token::Equal) => Comparison::Equal,
      Some(Token::NotEqual) => Comparison::NotEqual,
      _ => return Ok(left),
    };
    self.advance();
    let right = self.parse_union()?;
    Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
  }

  fn parse_union(&mut self) -> Result<Expr> {
    let mut left = self.parse_path()?;
    while self.peek() == Some(&Token::Pipe) {
      self.advance();
      let right = self.parse_path()?;
      left = Expr::Union(Box::new(left), Box::new(right));
    }
    Ok(left)
  }

  fn starts_step(&self) -> bool {
    match self.peek() {
      Some(Token::Dot | Token::DotDot | Token::At | Token::Star) => true,
      Some(Token::Name { .. }) => !self.starts_function_call() || self.starts_kind_test(),
      _ => false,
    }
  }

  fn starts_function_call(&self) -> bool {
    matches!(self.peek(), Some(Token::Name { .. })) && self.peek_at(1) == Some(&Token::LParen)
  }

  fn starts_kind_test(&self) -> bool {
    matches!(self.peek(), Some(Token::Name { prefix: None, local }) if local == "text" || local == "node")
      && self.peek_at(1) == Some(&Token::LParen)
      && self.peek_at(2) == Some(&Token::RParen)
  }

  fn descendant_or_self() -> PathStep {
    PathStep {
      axis: Axis::DescendantOrSelf,
      test: NodeTest::Node,
      predicates: Vec::new(),
    }
  }

  fn parse_path(&mut self) -> Result<Expr> {
    match self.peek() {
      Some(Token::Slash) => {
        self.advance();
        let steps = if self.starts_step() {
          self.parse_relative()?
        } else {
          Vec::new()
        };
        Ok(Expr::Path {
          start: PathStart::Root,
          steps,
        })
      }
      Some(Token::DoubleSlash) => {
        self.advance();
        let mut steps = vec![Self::descendant_or_self()];
        steps.extend(self.parse_relative()?);
        Ok(Expr::Path {
          start: PathStart::Root,
          steps,
        })
      }
      _ if self.starts_step() => Ok(Expr::Path {
        start: PathStart::Context,
        steps: self.parse_relative()?,
      }),
      _ => {
        let primary = self.parse_primary()?;
        let predicates = self.parse_predicates()?;
        let primary = if predicates.is_empty() {
          primary
        } else {
          Expr::Filter {
            primary: Box::new(primary),
            predicates,
          }
        };
        let mut steps = Vec::new();
        match self.peek() {
          Some(Token::Slash) => {
            self.advance();
            steps = self.parse_relative()?;
          }
          Some(Token::DoubleSlash) => {
            self.advance();
            steps.push(Self::descendant_or_self());
            steps.extend(self.parse_relative()?);
          }
          _ => return Ok(primary),
        }
        Ok(Expr::Path {
          start: PathStart::Expr(Box::new(primary)),
          steps,
        })
      }
    }
  }

  fn parse_relative(&mut self) -> Result<Vec<PathStep>> {
    let mut steps = vec![self.parse_step()?];
    loop {
      match self.peek() {
        Some(Token::Slash) => {
          self.advance();
        }
        Some(Token::DoubleSlash) => {
          self.advance();
          steps.push(Self::descendant_or_self());
        }
        _ => return Ok(steps),
      }
      steps.push(self.parse_step()?);
    }
  }

  fn parse_name_test(&mut self) -> Result<NodeTest> {
    match self.advance() {
      Some(Token::Star) => Ok(NodeTest::AnyName { prefix: None }),
      Some(Token::Name { prefix, local }) if local == "*" => Ok(NodeTest::AnyName { prefix }),
      Some(Token::Name { prefix, local }) => Ok(NodeTest::Name { prefix, local }),
      Some(token) => bail!("Expected a name test, found {:?}", token),
      None => bail!("Expected a name test, found end of query"),
    }
  }

  fn parse_step(&mut self) -> Result<PathStep> {
    let (axis, test) = match self.peek() {
      Some(Token::Dot) => {
        self.advance();
        (Axis::SelfNode, NodeTest::Node)
      }
      Some(Token::DotDot) => {
        self.advance();
        (Axis::Parent, NodeTest::Node)
      }
      Some(Token::At) => {
        self.advance();
        (Axis::Attribute, self.parse_name_test()?)
      }
      _ if self.starts_kind_test() => {
        let test = match self.advance() {
          Some(Token::Name { local, .. }) if local == "text" => NodeTest::Text,
          _ => NodeTest::Node,
        };
        self.expect(Token::LParen)?;
        self.expect(Token::RParen)?;
        (Axis::Child, test)
      }
      _ => (Axis::Child, self.parse_name_test()?),
    };
    let predicates = self.parse_predicates()?;
    Ok(PathStep { axis, test, predicates })
  }

  fn parse_predicates(&mut self) -> Result<Vec<Expr>> {
    let mut predicates = Vec::new();
    while self.peek() == Some(&Token::LBracket) {
      self.advance();
      predicates.push(self.parse_or()?);
      self.expect(Token::RBracket)?;
    }
    Ok(predicates)
  }

  fn parse_primary(&mut self) -> Result<Expr> {
    match self.advance() {
      Some(Token::String(value)) => Ok(Expr::String(value)),
      Some(Token::Number(value)) => Ok(Expr::Number(value)),
      Some(Token::Variable { prefix, local }) => Ok(Expr::Variable { prefix, local }),
      Some(Token::LParen) => {
        let expr = self.parse_or()?;
        self.expect(Token::RParen)?;
        Ok(expr)
      }
      Some(Token::Name { prefix, local }) if self.peek() == Some(&Token::LParen) => {
        self.advance();
        let name = match prefix {
          Some(prefix) => format!("{}:{}", prefix, local),
          None => local,
        };
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
          args.push(self.parse_or()?);
          while self.peek() == Some(&Token::Comma) {
            self.advance();
            args.push(self.parse_or()?);
          }
        }
        self.expect(Token::RParen)?;
        Ok(Expr::Function { name, args })
      }
      Some(token) => bail!("Unexpected {:?}", token),
      None => bail!("Unexpected end of query"),
    }
  }
}

/// A parsed query, reusable across evaluations.
#[derive(Clone, Debug)]
pub struct CompiledQuery {
  expr: Expr,
}

impl CompiledQuery {
  pub fn compile(query: &str) -> Result<Self> {
    let tokens = tokenize(query)?;
    if tokens.is_empty() {
      bail!("Empty query");
    }
    let expr = Parser { tokens, pos: 0 }.parse()?;
    Ok(Self { expr })
  }

  pub fn evaluate(&self, context: &QueryContext) -> Result<Vec<Item>> {
    let focus = context.node.clone().map(|node| Cursor {
      node,
      ancestors: Vec::new(),
    });
    let evaluator = Evaluator { context };
    Ok(evaluator.eval(&self.expr, focus.as_ref())?.into_items())
  }
}

/// A node together with the path leading to it, so `..` can walk back up.
#[derive(Clone)]
struct Cursor {
  node: Document,
  ancestors: Vec<Document>,
}

impl Cursor {
  fn child(&self, node: Document) -> Cursor {
    let mut ancestors = self.ancestors.clone();
    ancestors.push(self.node.clone());
    Cursor { node, ancestors }
  }
}

enum Value {
  Nodes(Vec<Cursor>),
  String(String),
  Number(f64),
  Boolean(bool),
}

impl Value {
  fn into_items(self) -> Vec<Item> {
    match self {
      Value::Nodes(nodes) => nodes.into_iter().map(|cursor| Item::Node(cursor.node)).collect(),
      Value::String(value) => vec![Item::String(value)],
      Value::Number(value) => vec![Item::Number(value)],
      Value::Boolean(value) => vec![Item::Boolean(value)],
    }
  }

  fn boolean(&self) -> bool {
    match self {
      Value::Nodes(nodes) => !nodes.is_empty(),
      Value::String(value) => !value.is_empty(),
      Value::Number(value) => *value != 0.0 && !value.is_nan(),
      Value::Boolean(value) => *value,
    }
  }

  fn string(&self) -> String {
    match self {
      Value::Nodes(nodes) => nodes.first().map(|cursor| cursor.node.string_value()).unwrap_or_default(),
      Value::String(value) => value.clone(),
      Value::Number(value) => format_number(*value),
      Value::Boolean(value) => value.to_string(),
    }
  }

  /// String values of every item, for general comparisons.
  fn strings(&self) -> Vec<String> {
    match self {
      Value::Nodes(nodes) => nodes.iter().map(|cursor| cursor.node.string_value()).collect(),
      other => vec![other.string()],
    }
  }
}

fn to_number(value: &str) -> f64 {
  value.trim().parse().unwrap_or(f64::NAN)
}

fn name_matches(test_prefix: &Option<String>, test_local: Option<&str>, node: &Document) -> bool {
  let Some(name) = node.name() else {
    return false;
  };
  let local_ok = test_local.map_or(true, |local| name.local_name() == local);
  let prefix_ok = match test_prefix {
    None => true,
    Some(prefix) => name.prefix() == Some(prefix.as_str()),
  };
  local_ok && prefix_ok
}

fn test_matches(test: &NodeTest, node: &Document, attribute_axis: bool) -> bool {
  let principal = if attribute_axis {
    node.is_attribute()
  } else {
    node.is_element()
  };
  match test {
    NodeTest::Node => true,
    NodeTest::Text => node.is_text(),
    NodeTest::Name { prefix, local } => principal && name_matches(prefix, Some(local), node),
    NodeTest::AnyName { prefix } => principal && name_matches(prefix, None, node),
  }
}

struct Evaluator<'a> {
  context: &'a QueryContext,
}

impl Evaluator<'_> {
  fn eval(&self, expr: &Expr, focus: Option<&Cursor>) -> Result<Value> {
    match expr {
      Expr::String(value) => Ok(Value::String(value.clone())),
      Expr::Number(value) => Ok(Value::Number(*value)),
      Expr::Variable { prefix, local } => self.variable(prefix.as_deref(), local),
      Expr::Function { name, args } => self.function(name, args, focus),
      Expr::Filter { primary, predicates } => {
        let nodes = self.nodes(self.eval(primary, focus)?)?;
        Ok(Value::Nodes(self.filter(nodes, predicates)?))
      }
      Expr::Path { start, steps } => self.path(start, steps, focus),
      Expr::Union(left, right) => {
        let mut nodes = self.nodes(self.eval(left, focus)?)?;
        nodes.extend(self.nodes(self.eval(right, focus)?)?);
        Ok(Value::Nodes(dedup(nodes)))
      }
      Expr::Compare(op, left, right) => {
        let left = self.eval(left, focus)?;
        let right = self.eval(right, focus)?;
        Ok(Value::Boolean(compare(*op, &left, &right)))
      }
      Expr::And(left, right) => {
        Ok(Value::Boolean(self.eval(left, focus)?.boolean() && self.eval(right, focus)?.boolean()))
      }
      Expr::Or(left, right) => Ok(Value::Boolean(self.eval(left, focus)?.boolean() || self.eval(right, focus)?.boolean())),
    }
  }

  fn nodes(&self, value: Value) -> Result<Vec<Cursor>> {
    match value {
      Value::Nodes(nodes) => Ok(nodes),
      other => bail!("Expected a node sequence, got the atomic value '{}'", other.string()),
    }
  }

  fn variable(&self, prefix: Option<&str>, local: &str) -> Result<Value> {
    self
      .context
      .variables
      .iter()
      .find(|(name, _)| name.local_name() == local && (prefix.is_none() || name.prefix() == prefix))
      .map(|(_, value)| Value::String(value.clone()))
      .ok_or_else(|| match prefix {
        Some(prefix) => anyhow!("Unbound variable ${}:{}", prefix, local),
        None => anyhow!("Unbound variable ${}", local),
      })
  }

  fn path(&self, start: &PathStart, steps: &[PathStep], focus: Option<&Cursor>) -> Result<Value> {
    let mut current = match start {
      PathStart::Root => focus
        .map(|cursor| match cursor.ancestors.first() {
          Some(root) => Cursor {
            node: root.clone(),
            ancestors: Vec::new(),
          },
          None => cursor.clone(),
        })
        .into_iter()
        .collect(),
      PathStart::Context => focus.cloned().into_iter().collect(),
      PathStart::Expr(expr) => self.nodes(self.eval(expr, focus)?)?,
    };

    for step in steps {
      let mut next = Vec::new();
      for cursor in &current {
        let selected = self.axis(cursor, step);
        next.extend(self.filter(selected, &step.predicates)?);
      }
      current = dedup(next);
    }
    Ok(Value::Nodes(current))
  }

  fn axis(&self, cursor: &Cursor, step: &PathStep) -> Vec<Cursor> {
    match step.axis {
      Axis::Child => cursor
        .node
        .children()
        .iter()
        .filter(|child| test_matches(&step.test, child, false))
        .map(|child| cursor.child(child.clone()))
        .collect(),
      Axis::Attribute => cursor
        .node
        .attributes()
        .iter()
        .map(|attribute| Document::attribute(attribute.name.clone(), attribute.value.clone()))
        .filter(|attribute| test_matches(&step.test, attribute, true))
        .map(|attribute| cursor.child(attribute))
        .collect(),
      Axis::DescendantOrSelf => {
        let mut out = Vec::new();
        collect_descendants_or_self(cursor, &mut out);
        out.retain(|c| test_matches(&step.test, &c.node, false));
        out
      }
      Axis::SelfNode => {
        if test_matches(&step.test, &cursor.node, cursor.node.is_attribute()) {
          vec![cursor.clone()]
        } else {
          Vec::new()
        }
      }
      Axis::Parent => match cursor.ancestors.split_last() {
        Some((parent, rest)) if test_matches(&step.test, parent, false) => vec![Cursor {
          node: parent.clone(),
          ancestors: rest.to_vec(),
        }],
        _ => Vec::new(),
      },
    }
  }

  fn filter(&self, nodes: Vec<Cursor>, predicates: &[Expr]) -> Result<Vec<Cursor>> {
    let mut nodes = nodes;
    for predicate in predicates {
      let mut kept = Vec::new();
      for (index, cursor) in nodes.into_iter().enumerate() {
        let keep = match self.eval(predicate, Some(&cursor))? {
          Value::Number(position) => (index + 1) as f64 == position,
          other => other.boolean(),
        };
        if keep {
          kept.push(cursor);
        }
      }
      nodes = kept;
    }
    Ok(nodes)
  }

  fn function(&self, name: &str, args: &[Expr], focus: Option<&Cursor>) -> Result<Value> {
    let arity = |expected: &[usize]| -> Result<()> {
      if expected.contains(&args.len()) {
        Ok(())
      } else {
        bail!("Function {}() called with {} argument(s)", name, args.len())
      }
    };
    // Argument, or the context node when omitted.
    let subject = |this: &Self| -> Result<Value> {
      match args.first() {
        Some(arg) => this.eval(arg, focus),
        None => Ok(Value::Nodes(focus.cloned().into_iter().collect())),
      }
    };

    match name {
      "true" => {
        arity(&[0])?;
        Ok(Value::Boolean(true))
      }
      "false" => {
        arity(&[0])?;
        Ok(Value::Boolean(false))
      }
      "not" => {
        arity(&[1])?;
        Ok(Value::Boolean(!self.eval(&args[0], focus)?.boolean()))
      }
      "boolean" => {
        arity(&[1])?;
        Ok(Value::Boolean(self.eval(&args[0], focus)?.boolean()))
      }
      "count" => {
        arity(&[1])?;
        let nodes = self.nodes(self.eval(&args[0], focus)?)?;
        Ok(Value::Number(nodes.len() as f64))
      }
      "string" => {
        arity(&[0, 1])?;
        Ok(Value::String(subject(self)?.string()))
      }
      "concat" => {
        if args.len() < 2 {
          bail!("Function concat() needs at least 2 arguments");
        }
        let mut out = String::new();
        for arg in args {
          out.push_str(&self.eval(arg, focus)?.string());
        }
        Ok(Value::String(out))
      }
      "contains" => {
        arity(&[2])?;
        let haystack = self.eval(&args[0], focus)?.string();
        let needle = self.eval(&args[1], focus)?.string();
        Ok(Value::Boolean(haystack.contains(&needle)))
      }
      "normalize-space" => {
        arity(&[0, 1])?;
        let value = subject(self)?.string();
        Ok(Value::String(value.split_whitespace().collect::<Vec<_>>().join(" ")))
      }
      "name" | "local-name" => {
        arity(&[0, 1])?;
        let nodes = self.nodes(subject(self)?)?;
        let value = nodes
          .first()
          .and_then(|cursor| cursor.node.name())
          .map(|qname| {
            if name == "name" {
              qname.lexical()
            } else {
              qname.local_name().to_string()
            }
          })
          .unwrap_or_default();
        Ok(Value::String(value))
      }
      "number" => {
        arity(&[0, 1])?;
        Ok(Value::Number(to_number(&subject(self)?.string())))
      }
      "iteration-position" | "p:iteration-position" => {
        arity(&[0])?;
        Ok(Value::Number(self.context.position as f64))
      }
      "iteration-size" | "p:iteration-size" => {
        arity(&[0])?;
        Ok(Value::Number(self.context.size as f64))
      }
      _ => bail!("Unknown function {}()", name),
    }
  }
}

fn collect_descendants_or_self(cursor: &Cursor, out: &mut Vec<Cursor>) {
  out.push(cursor.clone());
  if matches!(cursor.node.kind(), NodeKind::Attribute(_)) {
    return;
  }
  for child in cursor.node.children() {
    collect_descendants_or_self(&cursor.child(child.clone()), out);
  }
}

fn dedup(nodes: Vec<Cursor>) -> Vec<Cursor> {
  let mut seen = HashSet::new();
  nodes
    .into_iter()
    .filter(|cursor| cursor.node.is_attribute() || seen.insert(cursor.node.identity()))
    .collect()
}

fn compare(op: Comparison, left: &Value, right: &Value) -> bool {
  let holds = |equal: bool| match op {
    Comparison::Equal => equal,
    Comparison::NotEqual => !equal,
  };
  if matches!(left, Value::Boolean(_)) || matches!(right, Value::Boolean(_)) {
    return holds(left.boolean() == right.boolean());
  }
  let left_strings = left.strings();
  let right_strings = right.strings();
  let numeric = matches!(left, Value::Number(_)) || matches!(right, Value::Number(_));
  left_strings.iter().any(|l| {
    right_strings.iter().any(|r| {
      if numeric {
        let (l, r) = (to_number(l), to_number(r));
        !l.is_nan() && !r.is_nan() && holds(l == r)
      } else {
        holds(l == r)
      }
    })
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::qname::QName;
  use crate::document::node::Attribute;

  fn sample() -> Document {
    Document::document(vec![Document::element(
      "root",
      vec![Attribute::new("version", "2")],
      vec![
        Document::element("item", vec![Attribute::new("id", "a")], vec![Document::text("first")]),
        Document::element("item", vec![Attribute::new("id", "b")], vec![Document::text("second")]),
        Document::element(
          QName::with_prefix("urn:c", "c", "param"),
          vec![Attribute::new("name", "p")],
          Vec::new(),
        ),
      ],
    )])
  }

  fn eval(query: &str, context: &QueryContext) -> Vec<Item> {
    CompiledQuery::compile(query).unwrap().evaluate(context).unwrap()
  }

  fn strings(query: &str) -> Vec<String> {
    eval(query, &QueryContext::new(Some(sample())))
      .iter()
      .map(Item::string_value)
      .collect()
  }

  #[test]
  fn paths_select_in_document_order() {
    assert_eq!(strings("/root/item"), vec!["first", "second"]);
    assert_eq!(strings("//item/@id"), vec!["a", "b"]);
    assert_eq!(strings("root/item[2]"), vec!["second"]);
    assert_eq!(strings("//item[@id = 'a']"), vec!["first"]);
    assert_eq!(strings("//item[@id='b']/../@version"), vec!["2"]);
    assert_eq!(strings("//c:param/@name"), vec!["p"]);
    assert_eq!(strings("//param/@name"), vec!["p"]);
    assert!(strings("//x:param").is_empty());
  }

  #[test]
  fn functions_and_operators() {
    assert_eq!(strings("count(//item)"), vec!["2"]);
    assert_eq!(strings("concat('a', /root/@version, 'c')"), vec!["a2c"]);
    assert_eq!(strings("/root/@version = 2"), vec!["true"]);
    assert_eq!(strings("//item/@id = 'b' and not(//missing)"), vec!["true"]);
    assert_eq!(strings("normalize-space('  a   b ')"), vec!["a b"]);
    assert_eq!(strings("local-name(//c:param)"), vec!["param"]);
    assert_eq!(strings("name(//c:param)"), vec!["c:param"]);
  }

  #[test]
  fn variables_and_iteration_come_from_the_context() {
    let mut variables = std::collections::HashMap::new();
    variables.insert(QName::local("x"), "hello".to_string());
    let context = QueryContext::new(None).with_variables(variables).with_iteration(3, 7);
    let values: Vec<String> = eval("concat($x, '-', iteration-position(), '/', iteration-size())", &context)
      .iter()
      .map(Item::string_value)
      .collect();
    assert_eq!(values, vec!["hello-3/7"]);
    assert!(CompiledQuery::compile("$y").unwrap().evaluate(&context).is_err());
  }

  #[test]
  fn syntax_errors_are_reported() {
    assert!(CompiledQuery::compile("").is_err());
    assert!(CompiledQuery::compile("'open").is_err());
    assert!(CompiledQuery::compile("/root[").is_err());
    assert!(CompiledQuery::compile("a b").is_err());
  }
}

//! Parsing of the DOT-like pipeline source into a validated task graph.
//!
//! ```text
//! fetch [type=http method=GET url="https://example.com/price"];
//! parse [type=jsonparse path="data,price"];
//! fetch -> parse;
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{PipelineError, PipelineResult, TaskType};

/// One task of a parsed pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Id of the task in the source
    pub dot_id: String,
    /// Kind of work
    pub task_type: TaskType,
    /// Raw attributes, `type` excluded
    pub attrs: BTreeMap<String, String>,
    /// Predecessors in edge order, as indices into [`Pipeline::tasks`]
    pub inputs: Vec<usize>,
    /// Successors, as indices into [`Pipeline::tasks`]
    pub outputs: Vec<usize>,
}

impl TaskSpec {
    /// Whether nothing consumes this task's output.
    pub fn is_sink(&self) -> bool {
        self.outputs.is_empty()
    }

    /// The `index` attribute ordering the outputs of multiple sinks.
    pub fn output_index(&self) -> Option<i64> {
        self.attrs.get("index").and_then(|i| i.trim().parse().ok())
    }
}

/// A validated pipeline: acyclic, at least one sink, tasks in topological
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    /// Tasks in topological order; a task's position is its index
    pub tasks: Vec<TaskSpec>,
}

impl Pipeline {
    /// Parses and validates `source`.
    pub fn parse(source: &str) -> PipelineResult<Self> {
        let tokens = tokenize(source)?;
        let graph = Parser::new(tokens).parse()?;
        graph.into_pipeline()
    }

    /// Position of the task `dot_id`.
    pub fn index_of(&self, dot_id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.dot_id == dot_id)
    }

    /// Sinks ordered by their `index` attribute, then topologically.
    pub fn sinks(&self) -> Vec<usize> {
        let mut sinks: Vec<usize> = (0..self.tasks.len())
            .filter(|&i| self.tasks[i].is_sink())
            .collect();
        sinks.sort_by_key(|&i| (self.tasks[i].output_index().unwrap_or(i64::MAX), i));
        sinks
    }

    /// Every task `index` transitively depends on.
    pub fn ancestors(&self, index: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = self.tasks[index].inputs.clone();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                stack.extend(self.tasks[i].inputs.iter().copied());
            }
        }
        seen
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Word(String),
    Str(String),
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Eq,
    Arrow,
    Semi,
    Comma,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

fn is_word_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '[' | ']' | '{' | '}' | '=' | ';' | ',' | '"')
}

fn tokenize(source: &str) -> PipelineResult<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;
    let push = |tokens: &mut Vec<Token>, tok, line| tokens.push(Token { tok, line });

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let start = line;
                i += 2;
                loop {
                    match chars.get(i) {
                        None => return Err(PipelineError::parse(start, "unterminated comment")),
                        Some('*') if chars.get(i + 1) == Some(&'/') => {
                            i += 2;
                            break;
                        }
                        Some('\n') => line += 1,
                        _ => {}
                    }
                    i += 1;
                }
            }
            '"' => {
                let start = line;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(PipelineError::parse(start, "unterminated string")),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') if chars.get(i + 1) == Some(&'"') => {
                            value.push('"');
                            i += 2;
                        }
                        Some('\\') if chars.get(i + 1) == Some(&'\\') => {
                            value.push('\\');
                            i += 2;
                        }
                        Some(&ch) => {
                            if ch == '\n' {
                                line += 1;
                            }
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                push(&mut tokens, Tok::Str(value), start);
            }
            '[' => {
                push(&mut tokens, Tok::LBracket, line);
                i += 1;
            }
            ']' => {
                push(&mut tokens, Tok::RBracket, line);
                i += 1;
            }
            '{' => {
                push(&mut tokens, Tok::LBrace, line);
                i += 1;
            }
            '}' => {
                push(&mut tokens, Tok::RBrace, line);
                i += 1;
            }
            '=' => {
                push(&mut tokens, Tok::Eq, line);
                i += 1;
            }
            ';' => {
                push(&mut tokens, Tok::Semi, line);
                i += 1;
            }
            ',' => {
                push(&mut tokens, Tok::Comma, line);
                i += 1;
            }
            '-' if chars.get(i + 1) == Some(&'>') => {
                push(&mut tokens, Tok::Arrow, line);
                i += 2;
            }
            _ => {
                let mut word = String::new();
                while i < chars.len() && is_word_char(chars[i]) {
                    if chars[i] == '-' && chars.get(i + 1) == Some(&'>') {
                        break;
                    }
                    word.push(chars[i]);
                    i += 1;
                }
                push(&mut tokens, Tok::Word(word), line);
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Default)]
struct Graph {
    /// Declared tasks in declaration order
    nodes: Vec<(String, BTreeMap<String, String>, usize)>,
    /// Edges in source order, with the line they appear on
    edges: Vec<(String, String, usize)>,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|t| t.tok.clone());
        self.pos += 1;
        tok
    }

    fn id(&mut self) -> PipelineResult<String> {
        let line = self.line();
        match self.next() {
            Some(Tok::Word(w)) | Some(Tok::Str(w)) => Ok(w),
            other => Err(PipelineError::parse(
                line,
                format!("expected a task id, found {other:?}"),
            )),
        }
    }

    fn parse(mut self) -> PipelineResult<Graph> {
        let wrapped = matches!(self.peek(), Some(Tok::Word(w)) if w.eq_ignore_ascii_case("digraph") || w.eq_ignore_ascii_case("strict"));
        if wrapped {
            while !matches!(self.peek(), Some(Tok::LBrace) | None) {
                self.next();
            }
            if self.next() != Some(Tok::LBrace) {
                return Err(PipelineError::parse(self.line(), "expected `{`"));
            }
        }

        let mut graph = Graph::default();
        loop {
            match self.peek() {
                None if wrapped => {
                    return Err(PipelineError::parse(self.line(), "missing closing `}`"))
                }
                None => break,
                Some(Tok::RBrace) if wrapped => {
                    self.next();
                    if self.peek().is_some() {
                        return Err(PipelineError::parse(
                            self.line(),
                            "unexpected input after `}`",
                        ));
                    }
                    break;
                }
                Some(Tok::Semi) => {
                    self.next();
                }
                _ => self.statement(&mut graph)?,
            }
        }
        Ok(graph)
    }

    fn statement(&mut self, graph: &mut Graph) -> PipelineResult<()> {
        let line = self.line();
        let first = self.id()?;
        if self.peek() == Some(&Tok::Arrow) {
            let mut from = first;
            while self.peek() == Some(&Tok::Arrow) {
                self.next();
                let line = self.line();
                let to = self.id()?;
                graph.edges.push((from, to.clone(), line));
                from = to;
            }
            if self.peek() == Some(&Tok::LBracket) {
                return Err(PipelineError::parse(
                    self.line(),
                    "edge attributes are not supported",
                ));
            }
        } else {
            let attrs = if self.peek() == Some(&Tok::LBracket) {
                self.attrs()?
            } else {
                BTreeMap::new()
            };
            graph.nodes.push((first, attrs, line));
        }
        Ok(())
    }

    fn attrs(&mut self) -> PipelineResult<BTreeMap<String, String>> {
        self.next();
        let mut attrs = BTreeMap::new();
        loop {
            match self.peek() {
                Some(Tok::RBracket) => {
                    self.next();
                    return Ok(attrs);
                }
                Some(Tok::Comma) | Some(Tok::Semi) => {
                    self.next();
                }
                None => return Err(PipelineError::parse(self.line(), "missing `]`")),
                _ => {
                    let line = self.line();
                    let key = self.id()?;
                    if self.next() != Some(Tok::Eq) {
                        return Err(PipelineError::parse(
                            line,
                            format!("expected `=` after attribute {key:?}"),
                        ));
                    }
                    let value = match self.next() {
                        Some(Tok::Word(w)) | Some(Tok::Str(w)) => w,
                        other => {
                            return Err(PipelineError::parse(
                                line,
                                format!("expected a value for {key:?}, found {other:?}"),
                            ))
                        }
                    };
                    if attrs.insert(key.clone(), value).is_some() {
                        return Err(PipelineError::parse(
                            line,
                            format!("attribute {key:?} set twice"),
                        ));
                    }
                }
            }
        }
    }
}

impl Graph {
    fn into_pipeline(self) -> PipelineResult<Pipeline> {
        let mut by_id: HashMap<String, usize> = HashMap::new();
        let mut tasks = Vec::with_capacity(self.nodes.len());
        for (dot_id, mut attrs, line) in self.nodes {
            if by_id.contains_key(&dot_id) {
                return Err(PipelineError::parse(
                    line,
                    format!("task {dot_id:?} declared twice"),
                ));
            }
            let task_type = attrs
                .remove("type")
                .ok_or_else(|| PipelineError::parse(line, format!("task {dot_id:?} has no type")))?
                .parse::<TaskType>()
                .map_err(|e| PipelineError::parse(line, format!("task {dot_id:?}: {e}")))?;
            by_id.insert(dot_id.clone(), tasks.len());
            tasks.push(TaskSpec {
                dot_id,
                task_type,
                attrs,
                inputs: vec![],
                outputs: vec![],
            });
        }
        if tasks.is_empty() {
            return Err(PipelineError::InvalidDag("pipeline has no tasks".into()));
        }

        for (from, to, line) in self.edges {
            let lookup = |id: &str| {
                by_id.get(id).copied().ok_or_else(|| {
                    PipelineError::parse(line, format!("edge references undeclared task {id:?}"))
                })
            };
            let (f, t) = (lookup(&from)?, lookup(&to)?);
            if f == t {
                return Err(PipelineError::InvalidDag(format!(
                    "task {from:?} depends on itself"
                )));
            }
            if tasks[t].inputs.contains(&f) {
                return Err(PipelineError::parse(
                    line,
                    format!("duplicate edge {from:?} -> {to:?}"),
                ));
            }
            tasks[t].inputs.push(f);
            tasks[f].outputs.push(t);
        }

        // Kahn's algorithm, ties broken by declaration order
        let mut remaining: Vec<usize> = tasks.iter().map(|t| t.inputs.len()).collect();
        let mut ready: BTreeSet<usize> = (0..tasks.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(tasks.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &o in &tasks[i].outputs {
                remaining[o] -= 1;
                if remaining[o] == 0 {
                    ready.insert(o);
                }
            }
        }
        if order.len() != tasks.len() {
            let cyclic: Vec<&str> = (0..tasks.len())
                .filter(|&i| remaining[i] > 0)
                .map(|i| tasks[i].dot_id.as_str())
                .collect();
            return Err(PipelineError::InvalidDag(format!(
                "cycle through {}",
                cyclic.join(", ")
            )));
        }

        let mut position = vec![0; tasks.len()];
        for (pos, &i) in order.iter().enumerate() {
            position[i] = pos;
        }
        let mut slots: Vec<Option<TaskSpec>> = tasks.into_iter().map(Some).collect();
        let sorted = order
            .iter()
            .filter_map(|&i| slots[i].take())
            .map(|mut task| {
                task.inputs = task.inputs.iter().map(|&i| position[i]).collect();
                task.outputs = task.outputs.iter().map(|&i| position[i]).collect();
                task
            })
            .collect();
        Ok(Pipeline { tasks: sorted })
    }
}

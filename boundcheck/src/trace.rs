//! Allocation and access traces.
//!
//! A trace is a line-oriented script of allocator events and pointer
//! operations, replayed against a fresh [`BoundChecker`]. It lets the checker
//! be exercised end to end without an instrumented program:
//!
//! ```text
//! # comments run to the end of the line
//! alloc buf 16            # buf = checked_allocate(16)
//! ptr end buf 16          # end = checked_advance(buf, 16)
//! store buf 15 u8 7
//! expect-load buf 15 u8 7
//! expect end valid
//! load end 0 u8           # fatal: one past the end
//! ```

use crate::Addr;
use crate::check::{Access, Pointer};
use crate::checker::BoundChecker;
use crate::memory::{ArenaHeap, RawAllocator, parse_addr};
use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use tracing::{debug, info};

/// What `expect NAME STATE` asserts about a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerState {
    Valid,
    Invalid,
    Null,
}

impl fmt::Display for PointerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointerState::Valid => write!(f, "valid"),
            PointerState::Invalid => write!(f, "invalid"),
            PointerState::Null => write!(f, "null"),
        }
    }
}

impl PointerState {
    fn of(ptr: Pointer) -> Self {
        match ptr {
            Pointer::Valid(0) => PointerState::Null,
            Pointer::Valid(_) => PointerState::Valid,
            Pointer::Invalid => PointerState::Invalid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Alloc { name: String, size: u32 },
    Calloc { name: String, count: u32, size: u32 },
    Realloc { name: String, size: u32 },
    Free { name: String },
    Let { name: String, addr: Addr },
    Region { addr: Addr, size: u32 },
    Unregister { addr: Addr },
    Ptr { name: String, base: String, offset: i32 },
    Load { name: String, offset: i32, access: Access },
    Store { name: String, offset: i32, access: Access, value: i64 },
    Expect { name: String, state: PointerState },
    ExpectLoad { name: String, offset: i32, access: Access, value: i64 },
}

/// A statement and the 1-based line it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub number: usize,
    pub statement: Statement,
}

/// Parses a whole trace. Errors name the offending line.
pub fn parse(source: &str) -> Result<Vec<Line>> {
    let mut lines = Vec::new();
    for (index, text) in source.lines().enumerate() {
        let number = index + 1;
        let code = text.split('#').next().unwrap_or_default();
        let tokens: Vec<&str> = code.split_whitespace().collect();
        let Some((keyword, args)) = tokens.split_first() else {
            continue;
        };
        let statement =
            parse_statement(keyword, args).with_context(|| format!("line {number}"))?;
        lines.push(Line { number, statement });
    }
    Ok(lines)
}

fn parse_statement(keyword: &str, args: &[&str]) -> Result<Statement> {
    let statement = match keyword {
        "alloc" => {
            let [name, size] = arguments(keyword, args)?;
            Statement::Alloc {
                name: parse_name(name)?,
                size: parse_addr(size)?,
            }
        }
        "calloc" => {
            let [name, count, size] = arguments(keyword, args)?;
            Statement::Calloc {
                name: parse_name(name)?,
                count: parse_addr(count)?,
                size: parse_addr(size)?,
            }
        }
        "realloc" => {
            let [name, size] = arguments(keyword, args)?;
            Statement::Realloc {
                name: parse_name(name)?,
                size: parse_addr(size)?,
            }
        }
        "free" => {
            let [name] = arguments(keyword, args)?;
            Statement::Free {
                name: parse_name(name)?,
            }
        }
        "let" => {
            let [name, addr] = arguments(keyword, args)?;
            Statement::Let {
                name: parse_name(name)?,
                addr: parse_addr(addr)?,
            }
        }
        "region" => {
            let [addr, size] = arguments(keyword, args)?;
            Statement::Region {
                addr: parse_addr(addr)?,
                size: parse_addr(size)?,
            }
        }
        "unregister" => {
            let [addr] = arguments(keyword, args)?;
            Statement::Unregister {
                addr: parse_addr(addr)?,
            }
        }
        "ptr" => {
            let [name, base, offset] = arguments(keyword, args)?;
            Statement::Ptr {
                name: parse_name(name)?,
                base: parse_name(base)?,
                offset: parse_offset(offset)?,
            }
        }
        "load" => {
            let [name, offset, access] = arguments(keyword, args)?;
            Statement::Load {
                name: parse_name(name)?,
                offset: parse_offset(offset)?,
                access: access.parse()?,
            }
        }
        "store" => {
            let [name, offset, access, value] = arguments(keyword, args)?;
            Statement::Store {
                name: parse_name(name)?,
                offset: parse_offset(offset)?,
                access: access.parse()?,
                value: parse_signed(value)?,
            }
        }
        "expect" => {
            let [name, state] = arguments(keyword, args)?;
            let state = match state {
                "valid" => PointerState::Valid,
                "invalid" => PointerState::Invalid,
                "null" => PointerState::Null,
                other => bail!("expected valid, invalid or null, found `{other}`"),
            };
            Statement::Expect {
                name: parse_name(name)?,
                state,
            }
        }
        "expect-load" => {
            let [name, offset, access, value] = arguments(keyword, args)?;
            Statement::ExpectLoad {
                name: parse_name(name)?,
                offset: parse_offset(offset)?,
                access: access.parse()?,
                value: parse_signed(value)?,
            }
        }
        other => bail!("unknown statement `{other}`"),
    };
    Ok(statement)
}

fn arguments<'a, const N: usize>(keyword: &str, args: &[&'a str]) -> Result<[&'a str; N]> {
    match <[&str; N]>::try_from(args) {
        Ok(args) => Ok(args),
        Err(_) => bail!(
            "`{keyword}` takes {N} argument(s), found {}",
            args.len()
        ),
    }
}

fn parse_name(text: &str) -> Result<String> {
    let mut chars = text.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("`{text}` is not a valid pointer name");
    }
    Ok(text.to_string())
}

/// Parses a signed decimal or `0x` hexadecimal number.
fn parse_signed(text: &str) -> Result<i64> {
    let (negative, magnitude) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let parsed = match magnitude
        .strip_prefix("0x")
        .or_else(|| magnitude.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => magnitude.parse::<i64>(),
    };
    let value = parsed.with_context(|| format!("`{text}` is not a number"))?;
    Ok(if negative { -value } else { value })
}

fn parse_offset(text: &str) -> Result<i32> {
    let value = parse_signed(text)?;
    i32::try_from(value).with_context(|| format!("offset `{text}` does not fit in 32 bits"))
}

/// Replays traces against one checker, keeping named pointers between
/// statements.
#[derive(Debug)]
pub struct Replayer<H: RawAllocator = ArenaHeap> {
    checker: BoundChecker<H>,
    names: HashMap<String, Pointer>,
}

impl<H: RawAllocator> Replayer<H> {
    pub fn new(checker: BoundChecker<H>) -> Self {
        Self {
            checker,
            names: HashMap::new(),
        }
    }

    pub fn checker(&self) -> &BoundChecker<H> {
        &self.checker
    }

    pub fn pointer(&self, name: &str) -> Option<Pointer> {
        self.names.get(name).copied()
    }

    /// Runs every line in order, writing the value of each `load` to `out`.
    ///
    /// Stops at the first failing line. A bounds violation is returned as a
    /// [`crate::Violation`] that can be recovered with
    /// [`anyhow::Error::downcast_ref`].
    pub fn run(&mut self, lines: &[Line], out: &mut impl Write) -> Result<()> {
        for line in lines {
            debug!(line = line.number, statement = ?line.statement, "replaying");
            self.step(&line.statement, out)
                .with_context(|| format!("line {}", line.number))?;
        }
        info!(statements = lines.len(), "trace replayed");
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Pointer> {
        match self.pointer(name) {
            Some(ptr) => Ok(ptr),
            None => bail!("unknown pointer `{name}`"),
        }
    }

    fn bind(&mut self, name: &str, addr: Option<Addr>) {
        self.names
            .insert(name.to_string(), Pointer::Valid(addr.unwrap_or(0)));
    }

    fn step(&mut self, statement: &Statement, out: &mut impl Write) -> Result<()> {
        match statement {
            Statement::Alloc { name, size } => {
                let addr = self.checker.try_allocate(*size)?;
                self.bind(name, addr);
            }
            Statement::Calloc { name, count, size } => {
                let addr = self.checker.try_allocate_zeroed(*count, *size)?;
                self.bind(name, addr);
            }
            Statement::Realloc { name, size } => {
                let ptr = self.get(name)?;
                let addr = self.checker.try_reallocate(ptr.to_raw(), *size)?;
                self.bind(name, addr);
            }
            Statement::Free { name } => {
                let ptr = self.get(name)?;
                self.checker.try_deallocate(ptr.to_raw())?;
            }
            Statement::Let { name, addr } => {
                self.names.insert(name.clone(), Pointer::from_raw(*addr));
            }
            Statement::Region { addr, size } => self.checker.try_register_region(*addr, *size)?,
            Statement::Unregister { addr } => self.checker.try_unregister_region(*addr)?,
            Statement::Ptr { name, base, offset } => {
                let base = self.get(base)?;
                let ptr = self.checker.checked_advance(base, *offset);
                self.names.insert(name.clone(), ptr);
            }
            Statement::Load {
                name,
                offset,
                access,
            } => {
                let ptr = self.get(name)?;
                let value = self.checker.try_load(ptr, *offset, *access)?;
                writeln!(out, "{name}[{offset}] = {value}")?;
            }
            Statement::Store {
                name,
                offset,
                access,
                value,
            } => {
                let ptr = self.get(name)?;
                self.checker.try_store(ptr, *offset, *access, *value)?;
            }
            Statement::Expect { name, state } => {
                let actual = PointerState::of(self.get(name)?);
                if actual != *state {
                    bail!("expected `{name}` to be {state}, but it is {actual}");
                }
            }
            Statement::ExpectLoad {
                name,
                offset,
                access,
                value,
            } => {
                let ptr = self.get(name)?;
                let actual = self.checker.try_load(ptr, *offset, *access)?;
                if actual != *value {
                    bail!("expected `{name}[{offset}]` to hold {value}, found {actual}");
                }
            }
        }
        Ok(())
    }
}

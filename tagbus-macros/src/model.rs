//! Intermediate representation shared by the parser and the generator

use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, quote};
use syn::{Ident, Path, Type};

/// Execution policy named in `#[subscribe(mode = ...)]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Default,
    Post,
    Main,
    Async,
}

impl Mode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Default" | "default" => Some(Mode::Default),
            "Post" | "post" => Some(Mode::Post),
            "Main" | "main" => Some(Mode::Main),
            "Async" | "async" => Some(Mode::Async),
            _ => None,
        }
    }
}

impl ToTokens for Mode {
    fn to_tokens(&self, tokens: &mut TokenStream2) {
        tokens.extend(match self {
            Mode::Default => quote!(::tagbus::ThreadMode::Default),
            Mode::Post => quote!(::tagbus::ThreadMode::Post),
            Mode::Main => quote!(::tagbus::ThreadMode::Main),
            Mode::Async => quote!(::tagbus::ThreadMode::Async),
        });
    }
}

/// How one payload parameter is produced from the event
#[derive(Debug, Clone)]
pub enum ParamKind {
    /// `T`, cloned out of the payload
    Value(Type),
    /// `&T`, borrowed from the payload
    Ref(Type),
    /// `&str`, from a `String` or `&'static str` value
    Str,
    /// `String`, copied out of a `String` or `&'static str` value
    String,
    /// `&Event`
    EventRef,
    /// `Event`
    EventOwned,
}

impl ParamKind {
    pub fn is_event(&self) -> bool {
        matches!(self, ParamKind::EventRef | ParamKind::EventOwned)
    }
}

/// Parameter receiving the event tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagParam {
    Owned,
    Borrowed,
}

/// Payload consumption of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Empty,
    Event,
    Positional(usize),
}

/// One validated `#[subscribe]` method
#[derive(Debug, Clone)]
pub struct BindingModel {
    pub method: Ident,
    pub tags: Vec<String>,
    pub mode: Mode,
    pub tag_param: Option<TagParam>,
    pub params: Vec<ParamKind>,
    /// Payload parameter types as written
    pub param_names: Vec<String>,
    pub signature: String,
}

impl BindingModel {
    pub fn shape(&self) -> Shape {
        match self.params.as_slice() {
            [] => Shape::Empty,
            [param] if param.is_event() => Shape::Event,
            params => Shape::Positional(params.len()),
        }
    }
}

/// Everything generated for one `#[subscriber]` impl block
#[derive(Debug, Clone)]
pub struct UnitModel {
    pub self_ty: Type,
    pub type_name: String,
    pub parent: Option<Path>,
    pub bindings: Vec<BindingModel>,
}

/// Render a type the way it reads in source: `Vec<u8>`, `&str`, `(i32, bool)`
pub fn type_string(tokens: &impl ToTokens) -> String {
    let raw = tokens.to_token_stream().to_string();
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());

    for (i, &c) in chars.iter().enumerate() {
        if c != ' ' {
            out.push(c);
            continue;
        }
        let prev = out.chars().last();
        let next = chars.get(i + 1).copied();
        let word = |c: Option<char>| c.is_some_and(|c| c.is_alphanumeric() || c == '_');
        if word(prev) && word(next) {
            out.push(' ');
        } else if prev == Some(',') {
            out.push(' ');
        }
    }
    out
}

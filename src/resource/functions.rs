//! Template function environment.
//!
//! Each resource resolves its function set once at load time. The set is
//! then installed into a fresh MiniJinja environment every cycle, bound to
//! that cycle's snapshot.

use std::path::Path;
use std::sync::Arc;

use minijinja::value::{Rest, Value};
use minijinja::{Environment, Error, ErrorKind};

use super::crypt::Decryptor;
use super::snapshot::{KvPair, Snapshot};

/// A function callable from templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFunction {
    /// `base(path)`: last path component.
    Base,
    /// `json(text)`: parse a JSON object.
    Json,
    /// `jsonArray(text)`: parse a JSON array.
    JsonArray,
    /// `exists(key)`.
    Exists,
    /// `get(key)`: the `{key, value}` pair, an error if absent.
    Get,
    /// `gets(pattern)`: every matching pair.
    Gets,
    /// `getv(key[, default])`.
    Getv,
    /// `getvs(pattern)`: every matching value, sorted.
    Getvs,
    /// `ls(path)`: child names.
    Ls,
    /// `lsdir(path)`: child names that have children.
    Lsdir,
    /// Decrypting `get`.
    Cget,
    /// Decrypting `gets`.
    Cgets,
    /// Decrypting `getv`.
    Cgetv,
    /// Decrypting `getvs`.
    Cgetvs,
}

/// Functions available to every resource.
const BASE_FUNCTIONS: &[TemplateFunction] = &[
    TemplateFunction::Base,
    TemplateFunction::Json,
    TemplateFunction::JsonArray,
    TemplateFunction::Exists,
    TemplateFunction::Get,
    TemplateFunction::Gets,
    TemplateFunction::Getv,
    TemplateFunction::Getvs,
    TemplateFunction::Ls,
    TemplateFunction::Lsdir,
];

/// Functions added when a keyring is configured.
const CRYPT_FUNCTIONS: &[TemplateFunction] = &[
    TemplateFunction::Cget,
    TemplateFunction::Cgets,
    TemplateFunction::Cgetv,
    TemplateFunction::Cgetvs,
];

/// What a function call can see.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    snapshot: Arc<Snapshot>,
    decryptor: Option<Arc<Decryptor>>,
}

impl FunctionContext {
    /// Creates a context over a snapshot.
    #[must_use]
    pub const fn new(snapshot: Arc<Snapshot>, decryptor: Option<Arc<Decryptor>>) -> Self {
        Self {
            snapshot,
            decryptor,
        }
    }

    fn reveal(&self, value: &str) -> String {
        self.decryptor
            .as_ref()
            .and_then(|d| d.decrypt(value))
            .unwrap_or_else(|| value.to_string())
    }
}

impl TemplateFunction {
    /// Returns the name templates call the function by.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Json => "json",
            Self::JsonArray => "jsonArray",
            Self::Exists => "exists",
            Self::Get => "get",
            Self::Gets => "gets",
            Self::Getv => "getv",
            Self::Getvs => "getvs",
            Self::Ls => "ls",
            Self::Lsdir => "lsdir",
            Self::Cget => "cget",
            Self::Cgets => "cgets",
            Self::Cgetv => "cgetv",
            Self::Cgetvs => "cgetvs",
        }
    }

    /// Number of accepted arguments, as `(min, max)`.
    const fn arity(self) -> (usize, usize) {
        match self {
            Self::Getv | Self::Cgetv => (1, 2),
            _ => (1, 1),
        }
    }

    /// Invokes the function.
    ///
    /// # Errors
    ///
    /// Returns an error on a wrong argument count, invalid JSON, or a
    /// missing key without a default.
    pub fn call(self, ctx: &FunctionContext, args: &[String]) -> Result<Value, Error> {
        let (min, max) = self.arity();
        if args.len() < min {
            return Err(Error::new(
                ErrorKind::MissingArgument,
                format!("{}() expects at least {min} argument(s)", self.name()),
            ));
        }
        if args.len() > max {
            return Err(Error::new(
                ErrorKind::TooManyArguments,
                format!("{}() expects at most {max} argument(s)", self.name()),
            ));
        }

        let arg = args[0].as_str();
        let snapshot = &ctx.snapshot;

        match self {
            Self::Base => Ok(Value::from(
                Path::new(arg)
                    .file_name()
                    .map_or_else(|| String::from("/"), |n| n.to_string_lossy().into_owned()),
            )),
            Self::Json => parse_json(arg, serde_json::Value::is_object, "object"),
            Self::JsonArray => parse_json(arg, serde_json::Value::is_array, "array"),
            Self::Exists => Ok(Value::from(snapshot.exists(arg))),
            Self::Get | Self::Cget => {
                let value = snapshot.value(arg).ok_or_else(|| missing_key(arg))?;
                let value = if self == Self::Cget {
                    ctx.reveal(value)
                } else {
                    value.to_string()
                };
                Ok(Value::from_serialize(&KvPair {
                    key: arg.to_string(),
                    value,
                }))
            }
            Self::Gets | Self::Cgets => {
                let mut pairs = snapshot.matching(arg);
                if self == Self::Cgets {
                    for pair in &mut pairs {
                        pair.value = ctx.reveal(&pair.value);
                    }
                }
                Ok(Value::from_serialize(&pairs))
            }
            Self::Getv | Self::Cgetv => match snapshot.value(arg) {
                Some(value) if self == Self::Cgetv => Ok(Value::from(ctx.reveal(value))),
                Some(value) => Ok(Value::from(value)),
                None => args
                    .get(1)
                    .map(|default| Value::from(default.as_str()))
                    .ok_or_else(|| missing_key(arg)),
            },
            Self::Getvs | Self::Cgetvs => {
                let mut values: Vec<String> = snapshot
                    .matching(arg)
                    .into_iter()
                    .map(|pair| {
                        if self == Self::Cgetvs {
                            ctx.reveal(&pair.value)
                        } else {
                            pair.value
                        }
                    })
                    .collect();
                values.sort();
                Ok(Value::from(values))
            }
            Self::Ls => Ok(Value::from(snapshot.children(arg))),
            Self::Lsdir => Ok(Value::from(snapshot.child_dirs(arg))),
        }
    }
}

fn missing_key(key: &str) -> Error {
    Error::new(
        ErrorKind::InvalidOperation,
        format!("key does not exist: {key}"),
    )
}

fn parse_json(
    text: &str,
    expected: fn(&serde_json::Value) -> bool,
    kind: &str,
) -> Result<Value, Error> {
    let parsed: serde_json::Value = serde_json::from_str(text).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("invalid JSON: {e}"))
    })?;

    if !expected(&parsed) {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("expected a JSON {kind}"),
        ));
    }

    Ok(Value::from_serialize(&parsed))
}

/// The functions a resource's templates may call.
#[derive(Debug, Clone)]
pub struct FunctionSet {
    functions: Vec<TemplateFunction>,
    decryptor: Option<Arc<Decryptor>>,
}

impl FunctionSet {
    /// Resolves the function set. The decrypting accessors are only
    /// included when a decryptor is given.
    #[must_use]
    pub fn resolve(decryptor: Option<Arc<Decryptor>>) -> Self {
        let mut functions = BASE_FUNCTIONS.to_vec();
        if decryptor.is_some() {
            functions.extend_from_slice(CRYPT_FUNCTIONS);
        }
        Self {
            functions,
            decryptor,
        }
    }

    /// Returns the names of the functions in the set.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.functions.iter().map(|f| f.name()).collect()
    }

    /// Returns true if the decrypting accessors are available.
    #[must_use]
    pub const fn has_decryptor(&self) -> bool {
        self.decryptor.is_some()
    }

    /// Registers every function in `env`, bound to `snapshot`.
    pub fn install(&self, env: &mut Environment<'_>, snapshot: &Arc<Snapshot>) {
        for &function in &self.functions {
            let ctx = FunctionContext::new(Arc::clone(snapshot), self.decryptor.clone());
            env.add_function(function.name(), move |args: Rest<String>| {
                function.call(&ctx, &args)
            });
        }
    }
}

impl Default for FunctionSet {
    fn default() -> Self {
        Self::resolve(None)
    }
}

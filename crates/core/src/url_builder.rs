use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;

/// Characters left as-is in query values: RFC 3986 unreserved plus `/`.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Value side of a single query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Null,
    Str(String),
    List(Vec<String>),
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<u32> for QueryValue {
    fn from(value: u32) -> Self {
        Self::Str(value.to_string())
    }
}

impl<T: Into<QueryValue>> From<Option<T>> for QueryValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

impl From<Vec<String>> for QueryValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

/// Switches controlling how [`build_url`] treats nulls and lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    pub remove_none: bool,
    pub split_lists: bool,
}

impl BuildOptions {
    pub fn remove_none() -> Self {
        Self {
            remove_none: true,
            split_lists: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlBuildError {
    #[error("parameter '{0}' holds a list but split_lists is not enabled")]
    UnexpectedList(String),
}

/// Serializes `params` onto `base` in slice order.
///
/// A null that survives `remove_none` is written as a bare key. An empty
/// query leaves `base` untouched.
pub fn build_url(
    base: &str,
    params: &[(&str, QueryValue)],
    options: BuildOptions,
) -> Result<String, UrlBuildError> {
    let mut pairs: Vec<String> = Vec::with_capacity(params.len());
    for (key, value) in params {
        match value {
            QueryValue::Null if options.remove_none => continue,
            QueryValue::Null => pairs.push((*key).to_string()),
            QueryValue::Str(value) => pairs.push(encode_pair(key, value)),
            QueryValue::List(items) if options.split_lists => {
                pairs.extend(items.iter().map(|item| encode_pair(key, item)));
            }
            QueryValue::List(_) => return Err(UrlBuildError::UnexpectedList((*key).to_string())),
        }
    }

    if pairs.is_empty() {
        return Ok(base.to_string());
    }
    Ok(format!("{base}?{}", pairs.join("&")))
}

fn encode_pair(key: &str, value: &str) -> String {
    format!("{key}={}", utf8_percent_encode(value, QUERY_VALUE))
}

//! HTTP request methods.

use crate::error::ConversionError;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Request method. Standard methods are case-sensitive; any other valid
/// token is kept verbatim as an extension method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Connect,
    Trace,
    Extension(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::Trace => "TRACE",
            Method::Extension(name) => name,
        }
    }

    /// Convert to the `http` crate method shared by hyper and reqwest.
    pub fn to_http(&self) -> Result<hyper::Method, ConversionError> {
        hyper::Method::from_bytes(self.as_str().as_bytes())
            .map_err(|_| ConversionError::UnsupportedMethod(self.as_str().to_string()))
    }
}

/// RFC 9110 `tchar`
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

impl FromStr for Method {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "PATCH" => Method::Patch,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "CONNECT" => Method::Connect,
            "TRACE" => Method::Trace,
            other if !other.is_empty() && other.chars().all(is_token_char) => {
                Method::Extension(other.to_string())
            }
            other => return Err(ConversionError::UnsupportedMethod(other.to_string())),
        };
        Ok(method)
    }
}

impl TryFrom<&hyper::Method> for Method {
    type Error = ConversionError;

    fn try_from(method: &hyper::Method) -> Result<Self, Self::Error> {
        method.as_str().parse()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Method {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_methods() {
        assert_eq!("GET".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("PATCH".parse::<Method>().unwrap(), Method::Patch);
        assert_eq!("OPTIONS".parse::<Method>().unwrap(), Method::Options);
    }

    #[test]
    fn test_extension_method_kept_verbatim() {
        let method: Method = "PROPFIND".parse().unwrap();
        assert_eq!(method, Method::Extension("PROPFIND".to_string()));
        assert_eq!(method.as_str(), "PROPFIND");

        // Methods are case-sensitive, lowercase get is an extension token
        let lower: Method = "get".parse().unwrap();
        assert_eq!(lower, Method::Extension("get".to_string()));
    }

    #[test]
    fn test_invalid_method_rejected() {
        assert!(matches!(
            "BAD METHOD".parse::<Method>(),
            Err(ConversionError::UnsupportedMethod(_))
        ));
        assert!("".parse::<Method>().is_err());
    }

    #[test]
    fn test_http_method_round_trip() {
        for name in ["GET", "POST", "DELETE", "HEAD", "PURGE"] {
            let http = hyper::Method::from_bytes(name.as_bytes()).unwrap();
            let canonical = Method::try_from(&http).unwrap();
            assert_eq!(canonical.to_http().unwrap(), http);
        }
    }
}

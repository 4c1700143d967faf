use crate::config::PredicateConfig;
use crate::error::GatewayError;
use crate::proxy::context::RequestContext;
use http::HeaderName;
use regex::Regex;

/// A compiled route predicate. All predicates of a route must hold.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// `literal` matches exactly; with `wildcard` it also matches anything
    /// below it on a segment boundary.
    PathPrefix { literal: String, wildcard: bool },
    /// Upper-cased method names.
    Method(Vec<String>),
    HeaderMatch { name: HeaderName, regex: Regex },
}

impl Predicate {
    pub fn compile(cfg: &PredicateConfig) -> Result<Self, GatewayError> {
        match cfg {
            PredicateConfig::Path { pattern } => Ok(match pattern.strip_suffix("/**") {
                Some(literal) => Predicate::PathPrefix {
                    literal: literal.to_string(),
                    wildcard: true,
                },
                None => Predicate::PathPrefix {
                    literal: pattern.clone(),
                    wildcard: false,
                },
            }),
            PredicateConfig::Method { methods } => Ok(Predicate::Method(
                methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
            )),
            PredicateConfig::Header { name, regex } => {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| GatewayError::Config(format!("invalid header name '{name}'")))?;
                let regex = Regex::new(regex)
                    .map_err(|e| GatewayError::Config(format!("invalid regex '{regex}': {e}")))?;
                Ok(Predicate::HeaderMatch { name, regex })
            }
        }
    }

    pub fn matches(&self, ctx: &RequestContext) -> bool {
        match self {
            Predicate::PathPrefix { literal, wildcard } => {
                path_matches(&ctx.path, literal, *wildcard)
            }
            Predicate::Method(methods) => methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(ctx.method.as_str())),
            Predicate::HeaderMatch { name, regex } => ctx
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| regex.is_match(v)),
        }
    }
}

fn path_matches(path: &str, literal: &str, wildcard: bool) -> bool {
    if !wildcard {
        return path == literal;
    }
    match path.strip_prefix(literal) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || literal.ends_with('/'),
        None => false,
    }
}

//! Minimal route table for the relay's HTTP surface.
//!
//! Patterns are made of static segments and `{name}` parameters, e.g.
//! `/environments/{env_id}/flags/{user}`. Each route is bound to one method.

use http::Method;
use std::collections::HashMap;

#[derive(Debug)]
enum PathSegment {
    Static(String),
    Param(String),
}

#[derive(Debug)]
struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    /// Parses a path pattern string into a Path struct
    /// Supports:
    /// - Static segments: "/flags"
    /// - Dynamic parameters: "/flags/{user}"
    pub fn parse(path_str: &str) -> Self {
        let normalized_path = path_str.trim().trim_matches('/');

        let segments: Vec<PathSegment> = if normalized_path.is_empty() {
            vec![]
        } else {
            normalized_path
                .split('/')
                .map(|s| {
                    if let Some(stripped) = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                        PathSegment::Param(stripped.to_string())
                    } else {
                        PathSegment::Static(s.to_string())
                    }
                })
                .collect()
        };

        Path { segments }
    }

    /// Matches a request path against this path pattern
    /// Returns Some(params) if match succeeds, None otherwise
    fn matches<'a>(&self, request_path: &'a str) -> Option<HashMap<String, &'a str>> {
        let normalized_path = request_path.trim_matches('/');

        let request_segments: Vec<&'a str> = if normalized_path.is_empty() {
            vec![]
        } else {
            normalized_path.split('/').collect()
        };

        if request_segments.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (seg, req_segment) in self.segments.iter().zip(request_segments) {
            match seg {
                PathSegment::Static(s) => {
                    if req_segment != s {
                        return None;
                    }
                }
                PathSegment::Param(name) => {
                    // An empty segment never binds a parameter
                    if req_segment.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), req_segment);
                }
            }
        }

        Some(params)
    }
}

#[derive(Debug, PartialEq)]
pub struct RouteMatch<'a, A> {
    pub params: HashMap<String, &'a str>,
    pub action: &'a A,
}

#[derive(Debug, PartialEq)]
pub enum Resolution<'a, A> {
    Matched(RouteMatch<'a, A>),
    /// The path matched at least one route, but none for this method.
    MethodNotAllowed,
    NotFound,
}

#[derive(Debug)]
pub struct Route<A> {
    method: Method,
    path: Path,
    action: A,
}

impl<A> Route<A> {
    pub fn new(method: Method, path: &str, action: A) -> Self {
        Self {
            method,
            path: Path::parse(path),
            action,
        }
    }
}

#[derive(Debug)]
pub struct RouteTable<A> {
    routes: Vec<Route<A>>,
}

impl<A> RouteTable<A> {
    pub fn new(routes: Vec<Route<A>>) -> Self {
        Self { routes }
    }

    /// Returns the first route matching both method and path.
    pub fn resolve<'a>(&'a self, method: &Method, path: &'a str) -> Resolution<'a, A> {
        let mut path_matched = false;

        for route in &self.routes {
            let Some(params) = route.path.matches(path) else {
                continue;
            };
            if route.method == *method {
                return Resolution::Matched(RouteMatch {
                    params,
                    action: &route.action,
                });
            }
            path_matched = true;
        }

        if path_matched {
            Resolution::MethodNotAllowed
        } else {
            Resolution::NotFound
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> Method {
        Method::from_bytes(b"REPORT").unwrap()
    }

    fn table() -> RouteTable<&'static str> {
        RouteTable::new(vec![
            Route::new(Method::GET, "/flags/{user}", "get"),
            Route::new(report(), "/flags", "report"),
            Route::new(Method::GET, "/environments/{env_id}/flags/{user}", "env-get"),
        ])
    }

    #[test]
    fn test_static_path() {
        let table = table();
        match table.resolve(&report(), "/flags") {
            Resolution::Matched(m) => {
                assert_eq!(m.action, &"report");
                assert!(m.params.is_empty());
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
        assert!(
            matches!(table.resolve(&report(), "/flags/"), Resolution::Matched(_)),
            "with trailing slash normalization"
        );
    }

    #[test]
    fn test_dynamic_path() {
        let table = table();
        let Resolution::Matched(m) = table.resolve(&Method::GET, "/environments/abc/flags/eyJ9")
        else {
            panic!("expected a match");
        };
        assert_eq!(m.action, &"env-get");
        assert_eq!(m.params.get("env_id").copied(), Some("abc"));
        assert_eq!(m.params.get("user").copied(), Some("eyJ9"));
    }

    #[test]
    fn test_method_not_allowed() {
        let table = table();
        assert_eq!(
            table.resolve(&Method::POST, "/flags"),
            Resolution::MethodNotAllowed
        );
        assert_eq!(
            table.resolve(&report(), "/flags/eyJ9"),
            Resolution::MethodNotAllowed
        );
    }

    #[test]
    fn test_not_found() {
        let table = table();
        assert_eq!(table.resolve(&Method::GET, "/"), Resolution::NotFound);
        assert_eq!(
            table.resolve(&Method::GET, "/flags/a/b"),
            Resolution::NotFound,
            "extra segment doesn't match"
        );
        assert_eq!(
            table.resolve(&Method::GET, "/environments//flags/x"),
            Resolution::NotFound,
            "empty parameter doesn't match"
        );
    }

    #[test]
    fn test_path_parsing() {
        let path = Path::parse("");
        assert_eq!(path.segments.len(), 0);

        let path = Path::parse("/flags");
        assert_eq!(path.segments.len(), 1);

        let path = Path::parse("/environments/{env_id}/flags/{user}");
        assert_eq!(path.segments.len(), 4);
        assert!(matches!(&path.segments[1], PathSegment::Param(name) if name == "env_id"));
    }
}

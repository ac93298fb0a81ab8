use http::Method;
use serde_json::Value;
use std::collections::HashMap;

/// Raw argument map assembled by the binder: string keys, JSON values.
pub type ArgMap = serde_json::Map<String, Value>;

/// Parsed HTTP request data flowing through the dispatcher.
///
/// Header keys are lowercased on insertion. Identity normalization writes
/// propagated fields back into `headers` so collaborators and log records
/// observe consistent values.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method (GET, POST, ...).
    pub method: Method,
    /// Original request target as received from the wire, including any
    /// query string. Survives internal rewrites untouched.
    pub raw_target: String,
    /// Parsed request path, without the query string. A rewrite collaborator
    /// may replace this while `raw_target` keeps the original.
    pub path: String,
    /// Query string of the (possibly rewritten) target, without the `?`.
    pub query: Option<String>,
    /// HTTP headers, lowercase keys.
    pub headers: HashMap<String, String>,
    /// Peer address (`ip:port`).
    pub remote_addr: String,
    /// Host the client addressed.
    pub host: String,
    /// Whether the connection arrived over TLS.
    pub tls: bool,
    /// HTTP protocol version, e.g. `"1.1"`.
    pub proto: String,
    /// Raw request body, if any.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Build a request from a method and target (`/path?query`).
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        HttpRequest {
            method,
            raw_target: target.to_string(),
            path,
            query,
            headers: HashMap::new(),
            remote_addr: String::new(),
            host: String::new(),
            tls: false,
            proto: "1.1".to_string(),
            body: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(&name.to_ascii_lowercase());
    }

    /// Cookie value by name, parsed from the `cookie` header.
    pub fn cookie(&self, name: &str) -> Option<String> {
        let raw = self.header("cookie")?;
        raw.split(';').find_map(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            let k = parts.next()?.trim();
            if k == name {
                Some(parts.next().unwrap_or("").trim().to_string())
            } else {
                None
            }
        })
    }

    /// Peer IP without the port.
    pub fn remote_ip(&self) -> &str {
        self.remote_addr
            .rsplit_once(':')
            .map(|(ip, _)| ip)
            .unwrap_or(&self.remote_addr)
    }

    /// Content type, lowercased, without parameters.
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type")
            .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
    }
}

/// Split a request target into `(path, query)`.
pub fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (target.to_string(), None),
    }
}

/// Merge url-encoded pairs into an argument map. Repeated keys collapse into
/// a JSON array; a single occurrence stays a scalar string.
pub fn merge_encoded_pairs(args: &mut ArgMap, encoded: &str) {
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for (k, v) in url::form_urlencoded::parse(encoded.as_bytes()) {
        match grouped.iter_mut().find(|(name, _)| *name == k) {
            Some((_, values)) => values.push(v.to_string()),
            None => grouped.push((k.to_string(), vec![v.to_string()])),
        }
    }
    for (k, mut values) in grouped {
        if values.is_empty() {
            continue;
        }
        let value = if values.len() > 1 {
            Value::Array(values.into_iter().map(Value::String).collect())
        } else {
            Value::String(values.remove(0))
        };
        args.insert(k, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_target_into_path_and_query() {
        assert_eq!(split_target("/a/b?x=1"), ("/a/b".to_string(), Some("x=1".to_string())));
        assert_eq!(split_target("/a"), ("/a".to_string(), None));
    }

    #[test]
    fn merges_pairs_with_multi_values_as_arrays() {
        let mut args = ArgMap::new();
        merge_encoded_pairs(&mut args, "a=1&b=2&a=3&c=sp%20ace");
        assert_eq!(args["a"], json!(["1", "3"]));
        assert_eq!(args["b"], json!("2"));
        assert_eq!(args["c"], json!("sp ace"));
    }

    #[test]
    fn parses_cookies() {
        let mut req = HttpRequest::new(Method::GET, "/");
        req.set_header("Cookie", "sid=abc; theme=dark");
        assert_eq!(req.cookie("sid"), Some("abc".to_string()));
        assert_eq!(req.cookie("theme"), Some("dark".to_string()));
        assert_eq!(req.cookie("nope"), None);
    }

    #[test]
    fn remote_ip_strips_port() {
        let mut req = HttpRequest::new(Method::GET, "/");
        req.remote_addr = "10.1.2.3:5312".to_string();
        assert_eq!(req.remote_ip(), "10.1.2.3");
    }
}

//! Pre- and post-filters around handler execution.
//!
//! Filters run in registration order. A pre-filter may mutate the argument
//! map or answer the request itself by returning a result, which skips auth
//! and the handler; on a WebSocket-matched path it also suppresses the
//! upgrade, so the connection stays plain HTTP. Post-filters run for HTTP
//! only and may replace the handler result and/or mark the request failed
//! for logging purposes.

use crate::binder::HandlerResult;
use crate::server::request::{ArgMap, HttpRequest};
use crate::server::response::Response;

pub trait PreFilter: Send + Sync {
    /// Runs before auth and before the HTTP/WebSocket fork. Returning
    /// `Some` short-circuits the request with that result.
    fn before(
        &self,
        args: &mut ArgMap,
        req: &HttpRequest,
        resp: &mut Response,
    ) -> Option<HandlerResult>;
}

pub trait PostFilter: Send + Sync {
    /// Runs after the handler. Returns an optional replacement result and
    /// whether the request should be logged as failed.
    fn after(
        &self,
        args: &ArgMap,
        req: &HttpRequest,
        resp: &mut Response,
        result: Option<&HandlerResult>,
    ) -> (Option<HandlerResult>, bool);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::response::BufferWriter;
    use http::Method;
    use serde_json::json;

    struct Maintenance;
    impl PreFilter for Maintenance {
        fn before(
            &self,
            _args: &mut ArgMap,
            req: &HttpRequest,
            resp: &mut Response,
        ) -> Option<HandlerResult> {
            if req.path.starts_with("/blocked") {
                resp.write_status(503);
                return Some(HandlerResult::Text("down".to_string()));
            }
            None
        }
    }

    #[test]
    fn pre_filter_short_circuits_matching_paths() {
        let (writer, handle) = BufferWriter::pair();
        let mut resp = Response::new(writer);
        let req = HttpRequest::new(Method::GET, "/blocked/x");
        let mut args = ArgMap::new();
        let out = Maintenance.before(&mut args, &req, &mut resp);
        assert_eq!(out, Some(HandlerResult::Text("down".to_string())));
        assert_eq!(handle.status(), Some(503));
    }

    struct Wrapper;
    impl PostFilter for Wrapper {
        fn after(
            &self,
            _args: &ArgMap,
            _req: &HttpRequest,
            _resp: &mut Response,
            result: Option<&HandlerResult>,
        ) -> (Option<HandlerResult>, bool) {
            match result {
                Some(HandlerResult::Json(v)) => (
                    Some(HandlerResult::Json(json!({"data": v.clone()}))),
                    false,
                ),
                _ => (None, false),
            }
        }
    }

    #[test]
    fn post_filter_can_replace_the_result() {
        let (writer, _handle) = BufferWriter::pair();
        let mut resp = Response::new(writer);
        let req = HttpRequest::new(Method::GET, "/x");
        let result = HandlerResult::Json(json!({"ok": true}));
        let (replaced, failed) = Wrapper.after(&ArgMap::new(), &req, &mut resp, Some(&result));
        assert_eq!(
            replaced,
            Some(HandlerResult::Json(json!({"data": {"ok": true}})))
        );
        assert!(!failed);
    }
}

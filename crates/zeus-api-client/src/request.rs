use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use zeus_client_core::unwrap_envelope;

use crate::error::ApiError;

/// Endpoints that authenticate the caller themselves and must never trigger a refresh.
const AUTH_EXEMPT_SEGMENTS: &[&str] = &["/auth/login", "/auth/refresh", "/auth/register"];

#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    /// Opt out of the 401 refresh-and-replay path.
    pub skip_auth_refresh: bool,
    pub(crate) retried: bool,
}

impl ApiRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            skip_auth_refresh: false,
            retried: false,
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    #[must_use]
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json<T>(mut self, body: &T) -> Result<Self, ApiError>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(body).map_err(|error| {
            ApiError::new(
                crate::ApiErrorKind::InvalidRequest,
                format!("request body is not serializable: {error}"),
            )
            .with_cause(error)
        })?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    #[must_use]
    pub fn json_value(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    #[must_use]
    pub fn form<K, V>(mut self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = RequestBody::Form(
            fields
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    #[must_use]
    pub fn skip_auth_refresh(mut self) -> Self {
        self.skip_auth_refresh = true;
        self
    }

    #[must_use]
    pub fn is_retry(&self) -> bool {
        self.retried
    }

    #[must_use]
    pub fn is_auth_exempt(&self) -> bool {
        is_auth_exempt_path(&self.path)
    }

    /// Whether a 401 on this request may be answered with a refresh and replay.
    #[must_use]
    pub fn may_refresh(&self) -> bool {
        !self.retried && !self.skip_auth_refresh && !self.is_auth_exempt()
    }
}

#[must_use]
pub fn is_auth_exempt_path(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or_default();
    let normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    AUTH_EXEMPT_SEGMENTS
        .iter()
        .any(|segment| normalized.contains(segment))
}

/// Successful response with its body already read.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Decode `T` from the body, unwrapping a `{status, data}` envelope when present.
    pub fn json<T>(&self) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return unwrap_envelope(Value::Null).map_err(ApiError::decode);
        }
        let value: Value = serde_json::from_slice(&self.body).map_err(ApiError::decode)?;
        unwrap_envelope(value).map_err(ApiError::decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_endpoints_are_exempt() {
        struct Case {
            path: &'static str,
            exempt: bool,
        }
        let cases = [
            Case { path: "/auth/login", exempt: true },
            Case { path: "auth/login", exempt: true },
            Case { path: "/auth/refresh-token", exempt: true },
            Case { path: "/auth/refresh", exempt: true },
            Case { path: "/auth/register?invite=1", exempt: true },
            Case { path: "/auth/me", exempt: false },
            Case { path: "/auth/logout", exempt: false },
            Case { path: "/system/status", exempt: false },
            Case { path: "/agents?q=/auth/login", exempt: false },
        ];
        for case in cases {
            assert_eq!(is_auth_exempt_path(case.path), case.exempt, "{}", case.path);
        }
    }

    #[test]
    fn refresh_eligibility_respects_flags() {
        let request = ApiRequest::get("/auth/me");
        assert!(request.may_refresh());
        assert!(!request.clone().skip_auth_refresh().may_refresh());
        assert!(!ApiRequest::post("/auth/login").may_refresh());

        let mut replay = request;
        replay.retried = true;
        assert!(replay.is_retry());
        assert!(!replay.may_refresh());
    }

    #[test]
    fn builders_record_body_and_query() {
        let request = ApiRequest::post("/auth/login")
            .query("next", "/dashboard")
            .form([("username", "zeus"), ("grant_type", "password")]);
        assert_eq!(request.query, vec![("next".to_string(), "/dashboard".to_string())]);
        assert_eq!(
            request.body,
            RequestBody::Form(vec![
                ("username".to_string(), "zeus".to_string()),
                ("grant_type".to_string(), "password".to_string()),
            ])
        );

        let json_request = ApiRequest::put("/agents/1")
            .json(&json!({ "name": "atlas" }))
            .expect("serializable");
        assert_eq!(json_request.body, RequestBody::Json(json!({ "name": "atlas" })));
    }

    #[test]
    fn response_json_unwraps_envelopes() {
        let response = ApiResponse {
            status: StatusCode::OK,
            body: br#"{"status":"success","data":{"ok":true}}"#.to_vec(),
        };
        let value: Value = response.json().expect("decoded");
        assert_eq!(value, json!({ "ok": true }));

        let empty = ApiResponse {
            status: StatusCode::NO_CONTENT,
            body: Vec::new(),
        };
        let unit: Option<Value> = empty.json().expect("empty body decodes to null");
        assert_eq!(unit, None);

        let broken = ApiResponse {
            status: StatusCode::OK,
            body: b"not json".to_vec(),
        };
        let error = broken.json::<Value>().expect_err("decode error");
        assert_eq!(error.code(), "decode_error");
    }
}

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use serde::de::DeserializeOwned;

use crate::response::AppError;

/// JSON request body whose rejections use the admin API error envelope.
pub struct JsonBody<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(rejection_to_app_error(rejection)),
        }
    }
}

fn rejection_to_app_error(rejection: JsonRejection) -> AppError {
    match rejection {
        // serde path first, e.g. "sinceDays: invalid type: string" or "missing field `query`"
        JsonRejection::JsonDataError(e) => {
            let text = e.body_text();
            let detail = text
                .split_once("target type: ")
                .map_or(text.as_str(), |(_, rest)| rest);
            tracing::warn!(error = %detail, "Request body field rejected");
            AppError::bad_request("INVALID_FIELD", detail)
        }
        JsonRejection::MissingJsonContentType(_) => AppError::bad_request(
            "INVALID_REQUEST_BODY",
            "expected Content-Type: application/json",
        ),
        other => {
            tracing::warn!(error = %other, "Request body rejected");
            AppError::bad_request("INVALID_REQUEST_BODY", "request body is not valid JSON")
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Payload {
        #[allow(dead_code)]
        since_days: u32,
    }

    fn json_request(body: &'static str) -> Request {
        Request::builder()
            .method("PUT")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn data_errors_name_the_field() {
        let err = JsonBody::<Payload>::from_request(json_request(r#"{"sinceDays":"soon"}"#), &())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, "INVALID_FIELD");
        assert!(err.message.contains("sinceDays"), "{}", err.message);
    }

    #[tokio::test]
    async fn syntax_errors_are_invalid_body() {
        let err = JsonBody::<Payload>::from_request(json_request("{oops"), &())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, "INVALID_REQUEST_BODY");
    }
}

use axum::body::Bytes;
use axum::extract::FromRequest;
use serde::de::DeserializeOwned;

use crate::error::AppError;

/// `Json` whose rejections come back in the service's error shape.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

/// Body that may be left out entirely; an empty body yields `T::default()`.
pub fn optional_json<T>(body: &Bytes) -> Result<T, AppError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| AppError::Validation(vec![err.to_string()]))
}

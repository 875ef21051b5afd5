use axum::extract::{Multipart, State};
use axum::Json;

use crate::app_state::AppState;
use crate::models::api::UploadResponse;
use crate::models::job::JobState;
use crate::routes::error::ApiError;

const DEFAULT_OPERATIONS: &str = "resize";
const DEFAULT_FILE_NAME: &str = "upload";

struct UploadedFile {
    name: String,
    content_type: String,
    data: Vec<u8>,
}

/// POST /upload — store an image and queue it for processing.
///
/// Multipart fields: `file` (required) and `operations`, a comma-separated
/// list of operation names defaulting to `resize`.
pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut file: Option<UploadedFile> = None;
    let mut operations: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        match field.name() {
            Some("file") => {
                let name = sanitize_file_name(field.file_name().unwrap_or_default());
                let content_type = field.content_type().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                file = Some(UploadedFile {
                    name,
                    content_type,
                    data: data.to_vec(),
                });
            }
            Some("operations") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                operations = Some(text);
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| ApiError::BadRequest("Missing 'file' field".to_string()))?;
    if !file.content_type.starts_with("image/") {
        return Err(ApiError::BadRequest("File must be an image".to_string()));
    }
    image::guess_format(&file.data).map_err(|_| {
        ApiError::UnsupportedMediaType("File content is not a recognized image format".to_string())
    })?;

    let operations = operations.as_deref().unwrap_or(DEFAULT_OPERATIONS);
    let job = state
        .submitter
        .submit(&file.name, &file.content_type, &file.data, operations)
        .await?;

    Ok(Json(UploadResponse {
        job_id: job.job_id,
        status: JobState::Queued,
        operations: job.operations,
        message: "Image uploaded and queued for processing".to_string(),
    }))
}

/// Keep only the final path component of a client-supplied file name.
fn sanitize_file_name(raw: &str) -> String {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if name.is_empty() || name == "." || name == ".." {
        DEFAULT_FILE_NAME.to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("cat.jpg"), "cat.jpg");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\photos\\dog.png"), "dog.png");
        assert_eq!(sanitize_file_name(""), "upload");
        assert_eq!(sanitize_file_name("dir/"), "upload");
    }
}

use super::{valid_email, ErrorResponse};
use crate::{
    broker::publisher::{DomainEvent, EventPublisher},
    store::{normalize_email, InsertOutcome, NewUser, ObjectStore, RegistrationStore, Taken, Upload},
    verifier::credentials::hash_password,
};
use axum::{
    extract::{multipart::Field, Extension, Multipart},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;

// A concurrent signup can take the number we computed; retry with a fresh one.
const INSERT_ATTEMPTS: usize = 3;

/// Where registration events are published.
#[derive(Clone)]
pub struct RegistrationEvents {
    publisher: EventPublisher,
    exchange: String,
    routing_key: String,
}

impl RegistrationEvents {
    #[must_use]
    pub fn new(
        publisher: EventPublisher,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Published once a user row is committed. The password hash never leaves
/// the database.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistered {
    pub reg_no: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub photo: Option<String>,
    pub documents: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl DomainEvent for UserRegistered {
    fn event_type(&self) -> &'static str {
        "user.registered"
    }
}

/// Multipart form accepted by `POST /register`.
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct RegisterForm {
    name: String,
    email: String,
    phone: String,
    password: String,
    #[schema(value_type = Option<String>, format = Binary)]
    photo: Option<Vec<u8>>,
    #[schema(value_type = Vec<String>, format = Binary)]
    documents: Vec<Vec<u8>>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Registered {
    message: String,
    #[serde(rename = "regNo")]
    reg_no: String,
}

#[derive(Default)]
struct Submission {
    name: String,
    email: String,
    phone: String,
    password: String,
    photo: Option<Upload>,
    documents: Vec<Upload>,
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("phone", &self.phone)
            .field("photo", &self.photo.as_ref().map(|p| &p.file_name))
            .field("documents", &self.documents.len())
            .finish_non_exhaustive()
    }
}

impl Submission {
    fn validate(&self) -> Result<(), &'static str> {
        if self.name.trim().is_empty() {
            return Err("Missing name");
        }
        if !valid_email(&self.email) {
            return Err("Invalid email");
        }
        if self.phone.trim().is_empty() {
            return Err("Missing phone");
        }
        if self.password.is_empty() {
            return Err("Missing password");
        }
        Ok(())
    }
}

async fn upload(field: Field<'_>) -> Result<Option<Upload>, String> {
    let file_name = field.file_name().unwrap_or("upload").to_string();
    let content_type = field.content_type().map(str::to_string);
    let bytes = field
        .bytes()
        .await
        .map_err(|err| format!("Failed to read file '{file_name}': {err}"))?;
    // browsers send an empty part for an untouched file input
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(Upload {
        file_name,
        content_type,
        bytes: bytes.to_vec(),
    }))
}

async fn text(field: Field<'_>) -> Result<String, String> {
    field
        .text()
        .await
        .map(|value| value.trim().to_string())
        .map_err(|err| format!("Failed to read form: {err}"))
}

async fn read_submission(mut multipart: Multipart) -> Result<Submission, String> {
    let mut submission = Submission::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| format!("Failed to parse form: {err}"))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "name" => submission.name = text(field).await?,
            "email" => submission.email = normalize_email(&text(field).await?),
            "phone" => submission.phone = text(field).await?,
            "password" => {
                submission.password = field
                    .text()
                    .await
                    .map_err(|err| format!("Failed to read form: {err}"))?;
            }
            "photo" | "userImage" => submission.photo = upload(field).await?,
            "documents" | "documents[]" | "pdfFiles" | "aadharCard" => {
                if let Some(document) = upload(field).await? {
                    submission.documents.push(document);
                }
            }
            other => debug!("ignoring form field: {other}"),
        }
    }

    Ok(submission)
}

fn reject(status: StatusCode, error: &str) -> Response {
    (status, Json(ErrorResponse::new(error))).into_response()
}

fn conflict(taken: Taken) -> Response {
    match taken {
        Taken::Email => reject(StatusCode::CONFLICT, "Email already registered"),
        Taken::Phone => reject(StatusCode::CONFLICT, "Phone number already registered"),
    }
}

#[utoipa::path(
    post,
    path= "/register",
    request_body(content = RegisterForm, content_type = "multipart/form-data"),
    responses (
        (status = 201, description = "Registration successful", body = Registered, content_type = "application/json"),
        (status = 400, description = "Missing or invalid fields", body = ErrorResponse),
        (status = 409, description = "Email or phone number already registered", body = ErrorResponse),
        (status = 500, description = "Storage failure", body = ErrorResponse),
    ),
    tag= "register"
)]
// axum handler for register
#[instrument(skip_all)]
pub async fn register(
    users: Extension<Arc<dyn RegistrationStore>>,
    objects: Extension<Arc<dyn ObjectStore>>,
    events: Extension<Arc<RegistrationEvents>>,
    multipart: Multipart,
) -> Response {
    let submission = match read_submission(multipart).await {
        Ok(submission) => submission,
        Err(err) => {
            debug!("{err}");
            return reject(StatusCode::BAD_REQUEST, &err);
        }
    };

    debug!("submission: {:?}", submission);

    if let Err(err) = submission.validate() {
        return reject(StatusCode::BAD_REQUEST, err);
    }

    match users.0.find_conflict(&submission.email, &submission.phone).await {
        Ok(Some(taken)) => return conflict(taken),
        Ok(None) => {}
        Err(err) => {
            error!("Failed to check existing users: {err:#}");
            return reject(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    }

    let password = submission.password.clone();
    let password_hash = match tokio::task::spawn_blocking(move || hash_password(&password)).await {
        Ok(Ok(hash)) => hash,
        Ok(Err(err)) => {
            error!("Failed to hash password: {err}");
            return reject(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encrypt password");
        }
        Err(err) => {
            error!("Password hashing task failed: {err}");
            return reject(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encrypt password");
        }
    };

    let photo = match submission.photo {
        Some(photo) => match objects.0.put(photo).await {
            Ok(reference) => Some(reference),
            Err(err) => {
                error!("Failed to upload photo: {err:#}");
                return reject(StatusCode::INTERNAL_SERVER_ERROR, "Failed to upload user image");
            }
        },
        None => None,
    };

    let mut documents = Vec::with_capacity(submission.documents.len());
    for document in submission.documents {
        match objects.0.put(document).await {
            Ok(reference) => documents.push(reference),
            Err(err) => {
                error!("Failed to upload document: {err:#}");
                return reject(StatusCode::INTERNAL_SERVER_ERROR, "Failed to upload document");
            }
        }
    }

    let user = NewUser {
        name: submission.name,
        email: submission.email,
        phone: submission.phone,
        password_hash,
        photo,
        documents,
    };

    let mut reg_no = None;
    for _ in 0..INSERT_ATTEMPTS {
        match users.0.insert_user(&user).await {
            Ok(InsertOutcome::Created(number)) => {
                reg_no = Some(number);
                break;
            }
            Ok(InsertOutcome::Conflict) => {
                // lost a race on email/phone, or on the registration number
                match users.0.find_conflict(&user.email, &user.phone).await {
                    Ok(Some(taken)) => return conflict(taken),
                    Ok(None) => continue,
                    Err(err) => {
                        error!("Failed to check existing users: {err:#}");
                        return reject(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
                    }
                }
            }
            Err(err) => {
                error!("Error inserting user: {err:#}");
                return reject(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
            }
        }
    }

    let Some(reg_no) = reg_no else {
        warn!("registration number contention, giving up");
        return reject(StatusCode::CONFLICT, "Registration conflict, please retry");
    };

    info!(reg_no, "user registered");

    let event = UserRegistered {
        reg_no: reg_no.to_string(),
        name: user.name,
        email: user.email,
        phone: user.phone,
        photo: user.photo,
        documents: user.documents,
        created_at: Utc::now(),
    };

    // The row is committed; a lost event must not fail the signup.
    if let Err(err) = events
        .0
        .publisher
        .publish(&events.0.exchange, &events.0.routing_key, &event)
        .await
    {
        warn!(reg_no, "Failed to publish registration event: {err}");
    }

    (
        StatusCode::CREATED,
        Json(Registered {
            message: "User registered successfully. Processing in background.".to_string(),
            reg_no: reg_no.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> Submission {
        Submission {
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            phone: "+15550100".to_string(),
            password: "p1".to_string(),
            ..Submission::default()
        }
    }

    #[test]
    fn validate_submission() {
        assert!(submission().validate().is_ok());

        let mut invalid = submission();
        invalid.email = "ada".to_string();
        assert_eq!(invalid.validate(), Err("Invalid email"));

        let mut invalid = submission();
        invalid.name = "  ".to_string();
        assert_eq!(invalid.validate(), Err("Missing name"));

        let mut invalid = submission();
        invalid.password = String::new();
        assert_eq!(invalid.validate(), Err("Missing password"));
    }

    #[test]
    fn submission_debug_hides_password() {
        let debug = format!("{:?}", submission());
        assert!(!debug.contains("p1"));
        assert!(debug.contains("ada@example.com"));
    }

    #[test]
    fn event_wire_format() {
        let event = UserRegistered {
            reg_no: "20251000".to_string(),
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            phone: "+15550100".to_string(),
            photo: None,
            documents: vec!["http://localhost:9000/user-files/x.pdf".to_string()],
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap_or_default();
        assert_eq!(value["regNo"], "20251000");
        assert!(value.get("createdAt").is_some());
        assert!(value.get("password").is_none());
        assert_eq!(event.event_type(), "user.registered");
        assert_eq!(event.version(), 1);
    }
}

//! User endpoints. Writes go through the provisioning pipeline; reads hit the
//! repository (by id through the read cache).

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use ffm_core::validation::normalize_cpf;
use ffm_core::{EntityId, NewUser, ProvisioningRequest, User, UserChanges};
use serde::Deserialize;

use super::error::rejected;
use super::AppState;
use crate::service::provisioning::{ProvisioningError, ProvisioningOutcome};

type Outcome = Result<Json<ProvisioningOutcome>, ProvisioningError>;

/// `POST /users`
pub async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<NewUser>, JsonRejection>,
) -> Outcome {
    let _guard = state.shutdown.in_flight_guard();
    let Json(new_user) = payload.map_err(|r| rejected(&r))?;
    state
        .backend
        .pipeline
        .submit(ProvisioningRequest::CreateUser(new_user))
        .await
        .map(Json)
}

/// `GET /users/{id}`
pub async fn get_user(
    State(state): State<AppState>,
    id: Result<Path<EntityId>, PathRejection>,
) -> Result<Json<User>, ProvisioningError> {
    let Path(id) = id.map_err(|r| rejected(&r))?;
    let backend = &state.backend;
    let user = backend.user_cache.find_user(&backend.users, id).await?;
    Ok(Json(user))
}

#[derive(Debug, Deserialize)]
pub struct UserLookup {
    pub email: Option<String>,
    pub cpf: Option<String>,
}

/// `GET /users?email=..` or `GET /users?cpf=..`
pub async fn lookup_user(
    State(state): State<AppState>,
    query: Result<Query<UserLookup>, QueryRejection>,
) -> Result<Json<User>, ProvisioningError> {
    let Query(lookup) = query.map_err(|r| rejected(&r))?;
    let users = &state.backend.users;
    let user = match (lookup.email, lookup.cpf) {
        (Some(email), _) => users.find_by_email(&email.trim().to_lowercase()).await?,
        (None, Some(cpf)) => users.find_by_cpf(&normalize_cpf(&cpf)).await?,
        (None, None) => {
            return Err(ProvisioningError::Decode(
                "expected an email or cpf query parameter".to_string(),
            ))
        }
    };
    Ok(Json(user))
}

/// `PUT /users/{id}`
pub async fn update_user(
    State(state): State<AppState>,
    id: Result<Path<EntityId>, PathRejection>,
    payload: Result<Json<UserChanges>, JsonRejection>,
) -> Outcome {
    let _guard = state.shutdown.in_flight_guard();
    let Path(id) = id.map_err(|r| rejected(&r))?;
    let Json(changes) = payload.map_err(|r| rejected(&r))?;
    state
        .backend
        .pipeline
        .submit(ProvisioningRequest::UpdateUser { id, changes })
        .await
        .map(Json)
}

/// `DELETE /users/{id}`
pub async fn delete_user(
    State(state): State<AppState>,
    id: Result<Path<EntityId>, PathRejection>,
) -> Outcome {
    let _guard = state.shutdown.in_flight_guard();
    let Path(id) = id.map_err(|r| rejected(&r))?;
    state
        .backend
        .pipeline
        .submit(ProvisioningRequest::DeleteUser { id })
        .await
        .map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handlers::test_support::TestApp;
    use crate::traits::UserRepository as _;

    fn ana() -> NewUser {
        NewUser {
            name: "Ana".to_string(),
            last_name: "Souza".to_string(),
            email: "A@X.com".to_string(),
            cpf: "123.456.789-01".to_string(),
            password: "correct-horse".to_string(),
        }
    }

    #[tokio::test]
    async fn created_user_is_found_by_id_email_and_cpf() {
        let app = TestApp::new();
        app.start().await;

        let Json(outcome) = create_user(State(app.state.clone()), Ok(Json(ana())))
            .await
            .unwrap();
        let id = outcome.id();

        let Json(by_id) = get_user(State(app.state.clone()), Ok(Path(id))).await.unwrap();
        assert_eq!(by_id.email, "a@x.com");

        let Json(by_email) = lookup_user(
            State(app.state.clone()),
            Ok(Query(UserLookup {
                email: Some("a@X.COM".to_string()),
                cpf: None,
            })),
        )
        .await
        .unwrap();
        assert_eq!(by_email.id, id);

        let Json(by_cpf) = lookup_user(
            State(app.state.clone()),
            Ok(Query(UserLookup {
                email: None,
                cpf: Some("123.456.789-01".to_string()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(by_cpf.id, id);
        assert_eq!(app.state.shutdown.in_flight_count(), 0);

        app.stop().await;
    }

    #[tokio::test]
    async fn lookup_without_parameters_is_a_decode_error() {
        let app = TestApp::new();
        let err = lookup_user(
            State(app.state.clone()),
            Ok(Query(UserLookup {
                email: None,
                cpf: None,
            })),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProvisioningError::Decode(_)));
    }

    #[tokio::test]
    async fn missing_user_is_not_found() {
        let app = TestApp::new();
        let err = get_user(State(app.state.clone()), Ok(Path(EntityId::new())))
            .await
            .unwrap_err();
        assert_eq!(err, ProvisioningError::NotFound);
    }

    #[tokio::test]
    async fn writes_before_the_coordinator_starts_are_refused() {
        let app = TestApp::new();
        let err = create_user(State(app.state.clone()), Ok(Json(ana())))
            .await
            .unwrap_err();
        assert_eq!(err, ProvisioningError::CoordinatorDown);
        assert_eq!(app.store.count().await.unwrap(), 0);
    }
}

//! Contract endpoints.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use ffm_core::{Contract, EntityId, NewContract, ProvisioningRequest};
use serde::Deserialize;

use super::error::rejected;
use super::AppState;
use crate::service::provisioning::{ProvisioningError, ProvisioningOutcome};

/// `POST /contracts`: builds the file, then the contract around it.
pub async fn create_contract(
    State(state): State<AppState>,
    payload: Result<Json<NewContract>, JsonRejection>,
) -> Result<Json<ProvisioningOutcome>, ProvisioningError> {
    let _guard = state.shutdown.in_flight_guard();
    let Json(new_contract) = payload.map_err(|r| rejected(&r))?;
    state
        .backend
        .pipeline
        .submit(ProvisioningRequest::CreateContract(new_contract))
        .await
        .map(Json)
}

/// `GET /contracts/{id}`
pub async fn get_contract(
    State(state): State<AppState>,
    id: Result<Path<EntityId>, PathRejection>,
) -> Result<Json<Contract>, ProvisioningError> {
    let Path(id) = id.map_err(|r| rejected(&r))?;
    Ok(Json(state.backend.contracts.find_by_id(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CustomerQuery {
    pub customer: String,
}

/// `GET /contracts?customer=..`, oldest first.
pub async fn list_contracts(
    State(state): State<AppState>,
    query: Result<Query<CustomerQuery>, QueryRejection>,
) -> Result<Json<Vec<Contract>>, ProvisioningError> {
    let Query(query) = query.map_err(|r| rejected(&r))?;
    Ok(Json(
        state
            .backend
            .contracts
            .list_by_customer(&query.customer)
            .await?,
    ))
}

/// `DELETE /contracts/{id}`
pub async fn delete_contract(
    State(state): State<AppState>,
    id: Result<Path<EntityId>, PathRejection>,
) -> Result<Json<ProvisioningOutcome>, ProvisioningError> {
    let _guard = state.shutdown.in_flight_guard();
    let Path(id) = id.map_err(|r| rejected(&r))?;
    state
        .backend
        .pipeline
        .submit(ProvisioningRequest::DeleteContract { id })
        .await
        .map(Json)
}

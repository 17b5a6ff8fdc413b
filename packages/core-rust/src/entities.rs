//! Persisted entities and the payloads that create or change them.
//!
//! Entities are only ever mutated through a repository inside a store
//! transaction; the methods here are pure state transitions that the
//! repositories call from within their units of work.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::EntityId;
use crate::validation::{
    normalize_cpf, require_text, validate_cpf, validate_email, validate_password,
    ValidationError,
};

/// Placeholder written to the update log instead of a credential.
pub const REDACTED: &str = "[redacted]";

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// One entry of a user's change history: the values fields held before an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLogEntry {
    /// When the update was applied (millis since epoch).
    pub timestamp: i64,
    /// Field name to previous value, for every field the update changed.
    pub old_values: BTreeMap<String, String>,
}

/// A registered account holder.
///
/// `email` and `cpf` are unique across all users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: EntityId,
    pub name: String,
    pub last_name: String,
    pub email: String,
    /// Brazilian taxpayer number, digits only.
    pub cpf: String,
    /// Opaque credential digest produced by the gateway's hasher.
    #[serde(skip_serializing, default)]
    pub password: String,
    pub created_at: i64,
    pub update_log: Vec<UpdateLogEntry>,
}

impl User {
    /// Applies `changes`, appending an [`UpdateLogEntry`] with the replaced values.
    ///
    /// Returns `false` (and logs nothing) when every supplied value equals the
    /// current one.
    pub fn apply(&mut self, changes: &UserChanges, now: i64) -> bool {
        let mut old_values = BTreeMap::new();

        let mut swap = |field: &str, slot: &mut String, new: Option<&String>, secret: bool| {
            if let Some(new) = new {
                if *slot != *new {
                    let previous = std::mem::replace(slot, new.clone());
                    let logged = if secret { REDACTED.to_string() } else { previous };
                    old_values.insert(field.to_string(), logged);
                }
            }
        };

        let name = changes.name.as_deref().map(normalize_text);
        let last_name = changes.last_name.as_deref().map(normalize_text);
        let cpf = changes.cpf.as_deref().map(normalize_cpf);
        let email = changes.email.as_deref().map(normalize_email);

        swap("name", &mut self.name, name.as_ref(), false);
        swap("last_name", &mut self.last_name, last_name.as_ref(), false);
        swap("email", &mut self.email, email.as_ref(), false);
        swap("cpf", &mut self.cpf, cpf.as_ref(), false);
        swap("password", &mut self.password, changes.password.as_ref(), true);

        if old_values.is_empty() {
            return false;
        }
        self.update_log.push(UpdateLogEntry {
            timestamp: now,
            old_values,
        });
        true
    }
}

/// Payload for creating a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub last_name: String,
    pub email: String,
    pub cpf: String,
    pub password: String,
}

impl NewUser {
    /// # Errors
    ///
    /// Returns the first field that fails validation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("name", &self.name)?;
        require_text("last_name", &self.last_name)?;
        validate_email(&self.email)?;
        validate_cpf(&self.cpf)?;
        validate_password(&self.password)
    }

    /// Builds the entity to insert. The email is lower-cased and the CPF
    /// reduced to digits so uniqueness checks compare canonical forms.
    #[must_use]
    pub fn into_user(self, id: EntityId, now: i64) -> User {
        User {
            id,
            name: normalize_text(&self.name),
            last_name: normalize_text(&self.last_name),
            email: normalize_email(&self.email),
            cpf: normalize_cpf(&self.cpf),
            password: self.password,
            created_at: now,
            update_log: Vec::new(),
        }
    }
}

/// Partial update of a user. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChanges {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub cpf: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl UserChanges {
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyUpdate`] when no field is set, otherwise
    /// the first supplied field that fails validation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_none()
            && self.last_name.is_none()
            && self.email.is_none()
            && self.cpf.is_none()
            && self.password.is_none()
        {
            return Err(ValidationError::EmptyUpdate);
        }
        if let Some(name) = &self.name {
            require_text("name", name)?;
        }
        if let Some(last_name) = &self.last_name {
            require_text("last_name", last_name)?;
        }
        if let Some(email) = &self.email {
            validate_email(email)?;
        }
        if let Some(cpf) = &self.cpf {
            validate_cpf(cpf)?;
        }
        if let Some(password) = &self.password {
            validate_password(password)?;
        }
        Ok(())
    }
}

fn normalize_text(value: &str) -> String {
    value.trim().to_string()
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ---------------------------------------------------------------------------
// File / Contract
// ---------------------------------------------------------------------------

/// Metadata shared by every stored financial document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    /// Document type, e.g. `"contract"`.
    pub kind: String,
    /// Customer the document belongs to.
    pub customer: String,
}

impl File {
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when `kind` or `customer` is blank.
    pub fn new(kind: impl Into<String>, customer: impl Into<String>) -> Result<Self, ValidationError> {
        let file = Self {
            kind: kind.into(),
            customer: customer.into(),
        };
        require_text("kind", &file.kind)?;
        require_text("customer", &file.customer)?;
        Ok(file)
    }
}

/// A contract document and the extracts and invoices it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub id: EntityId,
    pub file: File,
    pub title: String,
    pub parties: Vec<String>,
    /// Subject matter of the contract.
    pub object: String,
    pub extract: Vec<EntityId>,
    pub invoice: Vec<EntityId>,
    pub created_at: i64,
}

/// Payload for creating a contract together with its file metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContract {
    pub kind: String,
    pub customer: String,
    pub title: String,
    pub parties: Vec<String>,
    pub object: String,
    #[serde(default)]
    pub extract: Vec<EntityId>,
    #[serde(default)]
    pub invoice: Vec<EntityId>,
}

impl NewContract {
    /// # Errors
    ///
    /// Returns the first field that fails validation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        File::new(self.kind.as_str(), self.customer.as_str())?;
        require_text("title", &self.title)?;
        require_text("object", &self.object)?;
        if self.parties.is_empty() {
            return Err(ValidationError::EmptyList { field: "parties" });
        }
        for party in &self.parties {
            require_text("parties", party)?;
        }
        Ok(())
    }

    /// Builds the file first, then the contract around it.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if either part is invalid.
    pub fn into_contract(self, id: EntityId, now: i64) -> Result<Contract, ValidationError> {
        self.validate()?;
        let file = File::new(self.kind, self.customer)?;
        Ok(Contract {
            id,
            file,
            title: self.title,
            parties: self.parties,
            object: self.object,
            extract: self.extract,
            invoice: self.invoice,
            created_at: now,
        })
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling and conversions.

use diesel::result::DatabaseErrorInformation;
use diesel::result::DatabaseErrorKind as DieselErrorKind;
use diesel::result::Error as DieselError;
use provisioner_common::api::external::Error as PublicError;
use provisioner_common::api::external::LookupType;
use provisioner_common::api::external::ResourceType;

/// Result of a database transaction
///
/// Closures run inside a transaction return `CustomError` to abort with a
/// specific public error, and bubble up diesel errors with `?`.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError<T> {
    /// The customizable error type.
    ///
    /// This error should be used for all non-Diesel transaction failures.
    #[error("Custom transaction error; {0}")]
    CustomError(T),

    /// The Diesel error type.
    #[error("Transaction error: {0}")]
    Database(#[from] DieselError),
}

impl From<PublicError> for TransactionError<PublicError> {
    fn from(err: PublicError) -> Self {
        TransactionError::CustomError(err)
    }
}

impl TransactionError<PublicError> {
    /// Converts into a public error, treating database errors according to
    /// `handler`.
    pub fn into_public(self, handler: ErrorHandler<'_>) -> PublicError {
        match self {
            TransactionError::CustomError(e) => e,
            TransactionError::Database(e) => public_error_from_diesel(e, handler),
        }
    }
}

/// Summarizes details provided with a database error.
fn format_database_error(
    kind: DieselErrorKind,
    info: &dyn DatabaseErrorInformation,
) -> String {
    let mut rv =
        format!("database error (kind = {:?}): {}\n", kind, info.message());
    if let Some(details) = info.details() {
        rv.push_str(&format!("DETAILS: {}\n", details));
    }
    if let Some(table_name) = info.table_name() {
        rv.push_str(&format!("TABLE NAME: {}\n", table_name));
    }
    if let Some(constraint_name) = info.constraint_name() {
        rv.push_str(&format!("CONSTRAINT NAME: {}\n", constraint_name));
    }
    rv
}

/// Allows the caller to handle user-facing errors, and provide additional
/// context which may be used to populate more informative errors.
pub enum ErrorHandler<'a> {
    /// The operation expected to fetch, update, or delete exactly one resource
    /// identified by the [`LookupType`].  If that row is not found,
    /// [`PublicError::ObjectNotFound`] is produced with the appropriate
    /// `LookupType`.
    NotFoundByLookup(ResourceType, LookupType),
    /// The operation was attempting to insert a row with a unique key.  If a
    /// row already exists with that key, [`PublicError::ObjectAlreadyExists`]
    /// is produced with the provided name.
    Conflict(ResourceType, &'a str),
    /// The operation does not expect any user errors.
    Server,
}

/// Converts a Diesel error to an external error, handling "NotFound" and
/// unique-key violations according to `handler`.
pub fn public_error_from_diesel(
    error: DieselError,
    handler: ErrorHandler<'_>,
) -> PublicError {
    match handler {
        ErrorHandler::NotFoundByLookup(resource_type, lookup_type) => {
            match error {
                DieselError::NotFound => {
                    lookup_type.into_not_found(resource_type)
                }
                _ => public_error_from_diesel_server(error),
            }
        }
        ErrorHandler::Conflict(resource_type, object_name) => match error {
            DieselError::DatabaseError(
                DieselErrorKind::UniqueViolation,
                _,
            ) => PublicError::ObjectAlreadyExists {
                type_name: resource_type,
                object_name: object_name.to_string(),
            },
            _ => public_error_from_diesel_server(error),
        },
        ErrorHandler::Server => public_error_from_diesel_server(error),
    }
}

fn public_error_from_diesel_server(error: DieselError) -> PublicError {
    match error {
        DieselError::DatabaseError(kind, info) => {
            PublicError::internal_error(&format_database_error(kind, &*info))
        }
        error => PublicError::internal_error(&format!(
            "Unknown diesel error: {:?}",
            error
        )),
    }
}

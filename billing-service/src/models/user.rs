//! Marketplace user model (clients and freelancers share the table).

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A marketplace user as seen by billing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    /// Customer id at the payment gateway, cached after first use.
    pub gateway_customer_id: Option<String>,
}

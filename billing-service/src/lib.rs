//! Billing core of the freelancer marketplace: weekly periods, invoice
//! generation, gateway delivery, notifications and webhook reconciliation.

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;

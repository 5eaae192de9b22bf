//! Domain models for billing-service.

mod contract;
mod invoice;
mod user;

pub use contract::{Contract, ContractBilling, ContractType, NewContract, Task, Work, WorkStatus};
pub use invoice::{
    merge_metadata, Invoice, InvoiceEvent, InvoiceItem, InvoiceStatus, InvoiceWithItems,
    NewInvoice, NewInvoiceItem, PENDING_GATEWAY_INVOICE_KEY,
};
pub use user::User;

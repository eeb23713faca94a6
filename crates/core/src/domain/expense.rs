use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::user::UserId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpenseId(pub String);

impl fmt::Display for ExpenseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseStatus {
    Pending,
    Approved,
    Rejected,
    /// Accepted on read for stored records; routing never produces it.
    InProgress,
}

impl ExpenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::InProgress => "in_progress",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "in_progress" => Some(Self::InProgress),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExpenseCategory {
    Travel,
    Food,
    Accommodation,
    Transportation,
    #[serde(rename = "Office Supplies")]
    OfficeSupplies,
    Entertainment,
    Other,
}

impl ExpenseCategory {
    pub const ALL: [ExpenseCategory; 7] = [
        Self::Travel,
        Self::Food,
        Self::Accommodation,
        Self::Transportation,
        Self::OfficeSupplies,
        Self::Entertainment,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Travel => "Travel",
            Self::Food => "Food",
            Self::Accommodation => "Accommodation",
            Self::Transportation => "Transportation",
            Self::OfficeSupplies => "Office Supplies",
            Self::Entertainment => "Entertainment",
            Self::Other => "Other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL.into_iter().find(|category| category.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for ExpenseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Pending,
    Approved,
    Rejected,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalHistoryEntry {
    pub approver_id: UserId,
    pub approver_name: String,
    pub action: HistoryAction,
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_override: bool,
}

impl ApprovalHistoryEntry {
    pub fn pending(approver_id: UserId, approver_name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            approver_id,
            approver_name: approver_name.into(),
            action: HistoryAction::Pending,
            comment: None,
            timestamp: at,
            is_override: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: ExpenseId,
    pub employee_id: UserId,
    pub employee_name: String,
    pub amount: Decimal,
    pub currency: String,
    pub amount_in_company_currency: Decimal,
    pub category: ExpenseCategory,
    pub description: String,
    pub date: NaiveDate,
    pub receipt_url: Option<String>,
    pub status: ExpenseStatus,
    pub current_approver_id: Option<UserId>,
    pub approval_history: Vec<ApprovalHistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub version: u32,
}

/// Where an expense currently sits in its approval route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RoutingState {
    AwaitingApprover { approver_id: UserId },
    AwaitingAssignment,
    Finalized { status: ExpenseStatus },
}

impl Expense {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_awaiting_decision(&self) -> bool {
        matches!(self.status, ExpenseStatus::Pending | ExpenseStatus::InProgress)
    }

    pub fn is_unrouted(&self) -> bool {
        self.is_awaiting_decision() && self.current_approver_id.is_none()
    }

    pub fn is_pending_for(&self, approver_id: &UserId) -> bool {
        self.status == ExpenseStatus::Pending
            && self.current_approver_id.as_ref() == Some(approver_id)
    }

    pub fn routing_state(&self) -> RoutingState {
        if self.is_terminal() {
            return RoutingState::Finalized { status: self.status };
        }

        match &self.current_approver_id {
            Some(approver_id) => RoutingState::AwaitingApprover { approver_id: approver_id.clone() },
            None => RoutingState::AwaitingAssignment,
        }
    }
}

/// Submission payload produced by the presentation layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewExpense {
    pub employee_id: UserId,
    pub amount: Decimal,
    pub currency: String,
    pub category: ExpenseCategory,
    pub description: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub receipt_url: Option<String>,
}

impl NewExpense {
    pub fn validate(&self) -> Result<(), DomainError> {
        let mut missing = Vec::new();
        if self.amount <= Decimal::ZERO {
            missing.push("amount");
        }
        if self.currency.trim().is_empty() {
            missing.push("currency");
        }
        if self.description.trim().is_empty() {
            missing.push("description");
        }

        if missing.is_empty() {
            return Ok(());
        }

        Err(DomainError::InvalidExpense(format!(
            "required fields missing or invalid: {}",
            missing.join(", ")
        )))
    }
}

/// Descriptive-field edit. Routing fields are deliberately absent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpensePatch {
    pub description: Option<String>,
    pub date: Option<NaiveDate>,
    pub receipt_url: Option<String>,
}

impl ExpensePatch {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.date.is_none() && self.receipt_url.is_none()
    }

    pub fn apply_to(&self, expense: &mut Expense) -> Result<(), DomainError> {
        if let Some(description) = &self.description {
            if description.trim().is_empty() {
                return Err(DomainError::InvalidExpense(
                    "description must not be empty".to_string(),
                ));
            }
            expense.description = description.clone();
        }
        if let Some(date) = self.date {
            expense.date = date;
        }
        if let Some(receipt_url) = &self.receipt_url {
            expense.receipt_url = Some(receipt_url.clone());
        }
        Ok(())
    }
}

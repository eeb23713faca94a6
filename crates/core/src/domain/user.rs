use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompanyId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Manager,
    Employee,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Employee => "employee",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "manager" => Some(Self::Manager),
            "employee" => Some(Self::Employee),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    pub company_id: CompanyId,
    pub manager_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// Admin rights are scoped to the admin's own company.
    pub fn administers(&self, company_id: &CompanyId) -> bool {
        self.is_admin() && &self.company_id == company_id
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    pub currency: String,
    pub country_code: String,
    pub created_at: DateTime<Utc>,
}

/// Admin-supplied user definition. The company is taken from the request path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDraft {
    pub name: String,
    pub email: String,
    pub role: UserRole,
    #[serde(default)]
    pub manager_id: Option<UserId>,
}

impl UserDraft {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvalidUser("name must not be empty".to_string()));
        }

        let email = self.email.trim();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
            _ => Err(DomainError::InvalidUser(format!("`{email}` is not an email address"))),
        }
    }

    pub fn into_user(self, id: UserId, company_id: CompanyId, created_at: DateTime<Utc>) -> User {
        User {
            id,
            email: self.email.trim().to_string(),
            name: self.name.trim().to_string(),
            role: self.role,
            company_id,
            manager_id: self.manager_id,
            created_at,
        }
    }
}

/// Partial edit of a company's name, currency or country.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanySettings {
    pub name: Option<String>,
    pub currency: Option<String>,
    pub country_code: Option<String>,
}

impl CompanySettings {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.currency.is_none() && self.country_code.is_none()
    }

    /// Codes are upper-cased. Existing expenses keep their converted amounts.
    pub fn apply_to(&self, company: &mut Company) -> Result<(), DomainError> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(DomainError::InvalidCompany("name must not be empty".to_string()));
            }
            company.name = name.trim().to_string();
        }
        if let Some(currency) = &self.currency {
            company.currency = alpha_code(currency, 3, "currency")?;
        }
        if let Some(country_code) = &self.country_code {
            company.country_code = alpha_code(country_code, 2, "country code")?;
        }
        Ok(())
    }
}

fn alpha_code(raw: &str, len: usize, label: &str) -> Result<String, DomainError> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() == len && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code)
    } else {
        Err(DomainError::InvalidCompany(format!("{label} `{raw}` must be {len} letters")))
    }
}

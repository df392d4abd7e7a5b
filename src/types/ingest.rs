//! Spreadsheet rows and the entity drafts built from them
//!
//! Drafts reference other entities by natural key (email, company name,
//! category name). Records carry resolved ids and are what gets written.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use uuid::Uuid;

use super::RowError;

// =============================================================================
// ROWS
// =============================================================================

/// A single spreadsheet cell
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl CellValue {
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Cell rendered as trimmed text; `None` when blank.
    /// Whole numbers drop their fractional part, so `5551234567.0` reads as `5551234567`.
    pub fn as_text(&self) -> Option<String> {
        match self {
            CellValue::Empty => None,
            CellValue::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                Some(format!("{}", *n as i64))
            }
            CellValue::Number(n) => Some(n.to_string()),
            CellValue::Bool(b) => Some(b.to_string()),
        }
    }
}

static EMPTY_CELL: CellValue = CellValue::Empty;

/// One data row keyed by column header
#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    /// Spreadsheet row number (header is row 1)
    pub row: u32,
    pub cells: HashMap<String, CellValue>,
}

impl RowRecord {
    #[cfg(test)]
    pub fn new(row: u32) -> Self {
        Self {
            row,
            cells: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn with(mut self, column: &str, value: CellValue) -> Self {
        self.cells.insert(column.to_string(), value);
        self
    }

    /// First non-blank cell among `columns`, or `Empty`
    pub fn get(&self, columns: &[&str]) -> &CellValue {
        columns
            .iter()
            .filter_map(|c| self.cells.get(*c))
            .find(|v| !v.is_blank())
            .unwrap_or(&EMPTY_CELL)
    }

    pub fn text(&self, columns: &[&str]) -> Option<String> {
        self.get(columns).as_text()
    }

    pub fn is_blank(&self) -> bool {
        self.cells.values().all(CellValue::is_blank)
    }
}

// =============================================================================
// DRAFTS
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct AgentDraft {
    pub agent_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserDraft {
    pub email: String,
    pub first_name: Option<String>,
    pub dob: Option<NaiveDateTime>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub gender: Option<String>,
    pub user_type: Option<String>,
}

/// Account owned by a user, referenced by email until resolved
#[derive(Debug, Clone, PartialEq)]
pub struct AccountDraft {
    pub account_name: String,
    pub user_email: String,
    pub row: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CarrierDraft {
    pub company_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryDraft {
    pub category_name: String,
}

/// Policy referencing its category, carrier and user by natural key
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDraft {
    pub policy_number: String,
    pub policy_start_date: Option<NaiveDateTime>,
    pub policy_end_date: Option<NaiveDateTime>,
    pub category_name: String,
    pub company_name: String,
    pub user_email: String,
    pub row: u32,
}

/// Output of normalizing one batch of rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub agents: Vec<AgentDraft>,
    pub users: Vec<UserDraft>,
    pub accounts: Vec<AccountDraft>,
    pub carriers: Vec<CarrierDraft>,
    pub categories: Vec<CategoryDraft>,
    pub policies: Vec<PolicyDraft>,
    /// Rows rejected before any draft was built
    pub rejected: Vec<RowError>,
}

impl NormalizedBatch {
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
            && self.users.is_empty()
            && self.accounts.is_empty()
            && self.carriers.is_empty()
            && self.categories.is_empty()
            && self.policies.is_empty()
    }
}

// =============================================================================
// RESOLVED RECORDS
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct AccountRecord {
    pub account_name: String,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRecord {
    pub policy_number: String,
    pub policy_start_date: Option<NaiveDateTime>,
    pub policy_end_date: Option<NaiveDateTime>,
    pub category_id: Uuid,
    pub company_id: Uuid,
    pub user_id: Uuid,
}

/// Ids of everything a batch persisted or matched, plus rows it dropped
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub agent_ids: Vec<Uuid>,
    pub user_ids: Vec<Uuid>,
    pub account_ids: Vec<Uuid>,
    pub carrier_ids: Vec<Uuid>,
    pub category_ids: Vec<Uuid>,
    pub policy_ids: Vec<Uuid>,
    pub row_errors: Vec<RowError>,
}

//! Row normalization and in-batch deduplication
//!
//! Turns a batch of spreadsheet rows into entity drafts. Agents, users,
//! accounts, carriers and categories collapse on their natural key (first
//! occurrence wins); every accepted row yields one policy draft.
//!
//! A row missing a natural key it depends on, or carrying a date that cannot
//! be read, is rejected as a whole and reported as a `RowError`.

use std::collections::HashSet;

use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};

use crate::types::{
    AccountDraft, AgentDraft, CarrierDraft, CategoryDraft, CellValue, NormalizedBatch,
    PolicyDraft, RowError, RowRecord, UserDraft,
};

// Column headers, first non-blank alias wins
const AGENT: &[&str] = &["agent", "agent_name"];
const FIRST_NAME: &[&str] = &["firstname", "first_name"];
const DOB: &[&str] = &["dob"];
const ADDRESS: &[&str] = &["address"];
const PHONE: &[&str] = &["phone"];
const STATE: &[&str] = &["state"];
const ZIP: &[&str] = &["zip", "zip_code"];
const EMAIL: &[&str] = &["email"];
const GENDER: &[&str] = &["gender"];
const USER_TYPE: &[&str] = &["userType", "user_type"];
const ACCOUNT_NAME: &[&str] = &["account_name"];
const COMPANY_NAME: &[&str] = &["company_name", "carrier"];
const CATEGORY_NAME: &[&str] = &["category_name", "category"];
const POLICY_NUMBER: &[&str] = &["policy_number"];
const POLICY_START: &[&str] = &["policy_start_date"];
const POLICY_END: &[&str] = &["policy_end_date"];

/// Fractional-day nudge so serials like `0.5 - ε` still land on the intended second
const SERIAL_EPSILON: f64 = 0.000_000_1;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Convert a spreadsheet date serial (days since 1899-12-30, fraction = time of day)
/// to a calendar date-time resolved to whole seconds.
pub fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 0.0 {
        return None;
    }

    let days = serial.floor();
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let date = epoch.checked_add_days(Days::new(days as u64))?;

    let seconds = (((serial - days) + SERIAL_EPSILON) * SECONDS_PER_DAY).floor() as u32;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(seconds.min(86_399), 0)?;

    Some(date.and_time(time))
}

/// Read a date cell. Blank is `Ok(None)`; anything present but unreadable is an error.
fn parse_date(cell: &CellValue) -> Result<Option<NaiveDateTime>, String> {
    match cell {
        CellValue::Empty => Ok(None),
        CellValue::Number(serial) => excel_serial_to_datetime(*serial)
            .map(Some)
            .ok_or_else(|| format!("'{}' is not a valid date serial", serial)),
        CellValue::Bool(b) => Err(format!("'{}' is not a date", b)),
        CellValue::Text(raw) => {
            let text = raw.trim();
            if text.is_empty() {
                return Ok(None);
            }
            if let Ok(serial) = text.parse::<f64>() {
                return excel_serial_to_datetime(serial)
                    .map(Some)
                    .ok_or_else(|| format!("'{}' is not a valid date serial", text));
            }
            for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
                if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
                    return Ok(Some(dt));
                }
            }
            for format in ["%Y-%m-%d", "%m/%d/%Y"] {
                if let Ok(date) = NaiveDate::parse_from_str(text, format) {
                    return Ok(Some(date.and_time(NaiveTime::MIN)));
                }
            }
            Err(format!("'{}' is not a date", text))
        }
    }
}

/// Fields a row needs before any draft can be built from it
struct RowKeys {
    agent_name: String,
    email: String,
    account_name: String,
    company_name: String,
    category_name: String,
    policy_number: String,
}

fn required_keys(row: &RowRecord) -> Result<RowKeys, String> {
    let agent_name = row.text(AGENT);
    let email = row.text(EMAIL).map(|e| e.to_lowercase());
    let account_name = row.text(ACCOUNT_NAME);
    let company_name = row.text(COMPANY_NAME);
    let category_name = row.text(CATEGORY_NAME);
    let policy_number = row.text(POLICY_NUMBER);

    match (agent_name, email, account_name, company_name, category_name, policy_number) {
        (Some(agent_name), Some(email), Some(account_name), Some(company_name), Some(category_name), Some(policy_number)) => {
            Ok(RowKeys {
                agent_name,
                email,
                account_name,
                company_name,
                category_name,
                policy_number,
            })
        }
        (agent, email, account, company, category, policy) => {
            let missing: Vec<&str> = [
                ("agent", agent.is_none()),
                ("email", email.is_none()),
                ("account_name", account.is_none()),
                ("company_name", company.is_none()),
                ("category_name", category.is_none()),
                ("policy_number", policy.is_none()),
            ]
            .into_iter()
            .filter_map(|(name, missing)| missing.then_some(name))
            .collect();
            Err(format!("missing required field(s): {}", missing.join(", ")))
        }
    }
}

fn date_field(row: &RowRecord, columns: &[&str]) -> Result<Option<NaiveDateTime>, String> {
    parse_date(row.get(columns)).map_err(|e| format!("invalid {}: {}", columns[0], e))
}

/// Normalize one batch. Pure: no I/O, same input gives same output.
pub fn normalize(rows: &[RowRecord]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();

    let mut seen_agents = HashSet::new();
    let mut seen_users = HashSet::new();
    let mut seen_accounts = HashSet::new();
    let mut seen_carriers = HashSet::new();
    let mut seen_categories = HashSet::new();

    for row in rows {
        let keys = match required_keys(row) {
            Ok(keys) => keys,
            Err(message) => {
                batch.rejected.push(RowError::new(row.row, message));
                continue;
            }
        };

        let dates = date_field(row, DOB).and_then(|dob| {
            Ok((dob, date_field(row, POLICY_START)?, date_field(row, POLICY_END)?))
        });
        let (dob, policy_start_date, policy_end_date) = match dates {
            Ok(dates) => dates,
            Err(message) => {
                batch.rejected.push(RowError::new(row.row, message));
                continue;
            }
        };

        if seen_agents.insert(keys.agent_name.clone()) {
            batch.agents.push(AgentDraft {
                agent_name: keys.agent_name.clone(),
            });
        }

        if seen_users.insert(keys.email.clone()) {
            batch.users.push(UserDraft {
                email: keys.email.clone(),
                first_name: row.text(FIRST_NAME),
                dob,
                address: row.text(ADDRESS),
                phone: row.text(PHONE),
                state: row.text(STATE),
                zip_code: row.text(ZIP),
                gender: row.text(GENDER),
                user_type: row.text(USER_TYPE),
            });
        }

        if seen_accounts.insert((keys.account_name.clone(), keys.email.clone())) {
            batch.accounts.push(AccountDraft {
                account_name: keys.account_name.clone(),
                user_email: keys.email.clone(),
                row: row.row,
            });
        }

        if seen_carriers.insert(keys.company_name.clone()) {
            batch.carriers.push(CarrierDraft {
                company_name: keys.company_name.clone(),
            });
        }

        if seen_categories.insert(keys.category_name.clone()) {
            batch.categories.push(CategoryDraft {
                category_name: keys.category_name.clone(),
            });
        }

        batch.policies.push(PolicyDraft {
            policy_number: keys.policy_number,
            policy_start_date,
            policy_end_date,
            category_name: keys.category_name,
            company_name: keys.company_name,
            user_email: keys.email,
            row: row.row,
        });
    }

    batch
}

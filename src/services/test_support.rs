//! Fixtures shared by service tests

use std::path::PathBuf;

use uuid::Uuid;

use crate::types::{CellValue, RowRecord};

pub const POLICY_HEADER: &str =
    "agent,firstname,email,account_name,company_name,category_name,policy_number,policy_start_date,policy_end_date";

/// Write `content` to a fresh file in the temp dir
pub fn write_temp_file(ext: &str, content: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("policy-ingest-{}.{}", Uuid::new_v4(), ext));
    std::fs::write(&path, content).unwrap();
    path
}

/// A row carrying every required column. An empty `email` leaves the cell blank.
pub fn policy_row(row: u32, agent: &str, email: &str, policy_number: &str) -> RowRecord {
    let text = |s: &str| {
        if s.is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(s.to_string())
        }
    };

    RowRecord::new(row)
        .with("agent", text(agent))
        .with("firstname", text("Test"))
        .with("email", text(email))
        .with("account_name", text("Acct"))
        .with("company_name", text("Carrier Co"))
        .with("category_name", text("Auto"))
        .with("policy_number", text(policy_number))
}

/// CSV upload with one line per `(agent, email, policy_number)`
pub fn policy_csv(rows: &[(&str, &str, &str)]) -> String {
    let mut csv = String::from(POLICY_HEADER);
    csv.push('\n');
    for (agent, email, policy_number) in rows {
        csv.push_str(&format!(
            "{agent},Test,{email},Acct,Carrier Co,Auto,{policy_number},2024-01-01,2025-01-01\n"
        ));
    }
    csv
}

//! Read-only status of a live deployment

use crate::error::RunError;
use crate::runner::{RunReport, Runner};
use crate::types::{Capacity, GroupDescriptor};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;

/// Printable view of a live group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    /// Group name
    pub name: String,
    /// Region
    pub region: String,
    /// Stack
    pub stack: String,
    /// Bounds
    pub capacity: Capacity,
    /// Running instances
    pub instance_count: i64,
    /// Healthy instances
    pub healthy_count: i64,
    /// Creation time, RFC 3339
    pub created_at: String,
    /// Tags
    pub tags: BTreeMap<String, String>,
}

impl From<&GroupDescriptor> for StatusSummary {
    fn from(group: &GroupDescriptor) -> Self {
        Self {
            name: group.name.clone(),
            region: group.region.clone(),
            stack: group.stack.clone(),
            capacity: group.capacity,
            instance_count: group.instance_count,
            healthy_count: group.healthy_count,
            created_at: group.created_at.to_rfc3339(),
            tags: group.tags.clone(),
        }
    }
}

impl StatusSummary {
    /// Write as aligned text
    ///
    /// # Errors
    /// I/O errors from `out`
    pub fn print(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "Name:       {}", self.name)?;
        writeln!(out, "Region:     {}", self.region)?;
        writeln!(out, "Stack:      {}", self.stack)?;
        writeln!(out, "Capacity:   {}", self.capacity)?;
        writeln!(
            out,
            "Instances:  {} running, {} healthy",
            self.instance_count, self.healthy_count
        )?;
        writeln!(out, "Created at: {}", self.created_at)?;
        if !self.tags.is_empty() {
            writeln!(out, "Tags:")?;
            for (key, value) in &self.tags {
                writeln!(out, "  {key} = {value}")?;
            }
        }
        Ok(())
    }
}

impl Runner {
    /// Main flow of `status`
    ///
    /// # Errors
    /// Inspector failures and output errors
    pub async fn status(&mut self) -> Result<RunReport, RunError> {
        let inspector = self.inspector()?;
        let handle = inspector.select_stack(&self.config.application).await?;
        let group = inspector.get_stack_information(&handle).await?;

        let summary = StatusSummary::from(&group);
        if self.config.json_output {
            let json = serde_json::to_string_pretty(&summary)
                .map_err(|e| RunError::Output(std::io::Error::other(e)))?;
            writeln!(self.out, "{json}")?;
        } else {
            summary.print(self.out.as_mut())?;
        }
        self.out.flush()?;
        Ok(RunReport::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn group() -> GroupDescriptor {
        GroupDescriptor {
            name: "hello-artd_v002".to_string(),
            region: "us-east-1".to_string(),
            stack: "artd".to_string(),
            capacity: Capacity::new(1, 3, 2),
            instance_count: 2,
            healthy_count: 2,
            created_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            tags: BTreeMap::from([("app".to_string(), "hello".to_string())]),
        }
    }

    #[test]
    fn summary_text() {
        let mut out = Vec::new();
        StatusSummary::from(&group()).print(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("hello-artd_v002"));
        assert!(text.contains("Min: 1, Desired: 2, Max: 3"));
        assert!(text.contains("app = hello"));
    }

    #[test]
    fn summary_json() {
        let json = serde_json::to_value(StatusSummary::from(&group())).unwrap();
        assert_eq!(json["capacity"]["desired"], 2);
        assert_eq!(json["created_at"], "2024-01-02T03:04:05+00:00");
    }
}

//! Analysis prompt handed to the in-sandbox agent.

use crate::staging::FileManifest;

const GUIDELINES: &[&str] = &[
    "You are a data analyst working in an isolated environment without internet access.",
    "Inspect the data before analysing it: print shapes, column names, dtypes and a few rows.",
    "Excel workbooks may contain several sheets; check all of them before drawing conclusions.",
    "There is no display. Save every chart to a file instead of showing it.",
    "Write output files only inside the output directory. You may create subdirectories there.",
    "Never overwrite a file; if a name is taken, choose a new one.",
    "If the data is inadequate for the task, say so clearly and stop.",
];

/// Task text plus the fixed guidelines and the input listing
#[derive(Debug, Clone)]
pub struct AnalysisPrompt<'a> {
    task: &'a str,
    manifest: &'a FileManifest,
}

impl<'a> AnalysisPrompt<'a> {
    pub fn new(task: &'a str, manifest: &'a FileManifest) -> Self {
        Self { task, manifest }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(self.task.trim());
        out.push_str("\n\nGuidelines:\n");
        for line in GUIDELINES {
            out.push_str("- ");
            out.push_str(line);
            out.push('\n');
        }

        if !self.manifest.inputs.is_empty() {
            out.push_str("\nAvailable Source Files:\n");
            for entry in &self.manifest.inputs {
                match entry.size_bytes {
                    Some(size) => out.push_str(&format!("- {} ({} bytes)\n", entry.sandbox_path, size)),
                    None => out.push_str(&format!("- {}\n", entry.sandbox_path)),
                }
            }
        }

        out.push_str(&format!("\nOutput directory: {}\n", self.manifest.output_dir));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::ManifestEntry;

    #[test]
    fn test_render_lists_sources_and_output_dir() {
        let manifest = FileManifest {
            inputs: vec![ManifestEntry {
                mount_name: "data/sales.xlsx".to_string(),
                sandbox_path: "/source_files/data/sales.xlsx".to_string(),
                size_bytes: Some(2048),
            }],
            output_dir: "/analyst/output".to_string(),
        };
        let text = AnalysisPrompt::new("  summarize totals\n", &manifest).render();

        assert!(text.starts_with("summarize totals\n\nGuidelines:"));
        assert!(text.contains("check all of them"));
        assert!(text.contains("Available Source Files:\n- /source_files/data/sales.xlsx (2048 bytes)"));
        assert!(text.ends_with("Output directory: /analyst/output\n"));
    }

    #[test]
    fn test_render_without_inputs_has_no_source_section() {
        let manifest = FileManifest {
            inputs: vec![],
            output_dir: "/analyst/output".to_string(),
        };
        let text = AnalysisPrompt::new("plot a sine wave", &manifest).render();
        assert!(!text.contains("Available Source Files"));
    }
}

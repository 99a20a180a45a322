use super::AttestationStatement;
use std::fmt::Write;

/// Markdown summary of a statement for humans reading CI output.
pub fn render_markdown(statement: &AttestationStatement) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# Change attestation\n");
    let _ = writeln!(md, "- **Base:** `{}`", statement.base_branch);
    let _ = writeln!(
        md,
        "- **Head:** `{}` ({})",
        statement.head_ref,
        statement
            .head_commit
            .get(..12)
            .unwrap_or(&statement.head_commit)
    );
    if let Some(pr) = &statement.pr {
        match &pr.url {
            Some(url) => {
                let _ = writeln!(md, "- **PR:** [#{}]({})", pr.number, url);
            }
            None => {
                let _ = writeln!(md, "- **PR:** #{}", pr.number);
            }
        }
    }
    let _ = writeln!(
        md,
        "- **Generated:** {}",
        statement.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let _ = writeln!(
        md,
        "\n## Files ({} changed, +{} -{})\n",
        statement.files.len(),
        statement.total_additions(),
        statement.total_deletions()
    );
    if statement.files.is_empty() {
        md.push_str("_No changes._\n");
        return md;
    }
    md.push_str("| File | + | - |\n|---|---:|---:|\n");
    for file in &statement.files {
        let _ = writeln!(md, "| `{}` | {} | {} |", file.path, file.additions, file.deletions);
    }
    md
}

//! Terminal styling helpers.

use console::Style;

use ariadne_core::models::DiffStatus;

/// Green check mark prefix.
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Red cross prefix.
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Colored status label for table cells.
pub fn status(status: DiffStatus) -> String {
    let style = match status {
        DiffStatus::Pending | DiffStatus::Verifying => Style::new().yellow(),
        DiffStatus::Verified => Style::new().green(),
        DiffStatus::Merged => Style::new().blue(),
        DiffStatus::Rejected | DiffStatus::Conflicted => Style::new().red(),
    };
    style.apply_to(status.to_string()).to_string()
}

pub fn resolved(resolved: bool) -> String {
    if resolved {
        Style::new().green().apply_to("resolved").to_string()
    } else {
        Style::new().red().apply_to("open").to_string()
    }
}

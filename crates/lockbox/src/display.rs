//! Terminal table rendering for `lockbox ls`

/// Narrowest the KEY column gets
const MIN_WIDTH: usize = 20;
/// Gap after the widest key
const PADDING: usize = 3;

/// Render a `KEY VALUE` table with the key column padded to a common width.
pub fn table<'a>(rows: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let rows: Vec<(&str, &str)> = rows.into_iter().collect();

    let widest = rows
        .iter()
        .map(|(key, _)| key.chars().count())
        .chain(std::iter::once("KEY".len()))
        .max()
        .unwrap_or(0);
    let width = (widest + PADDING).max(MIN_WIDTH);

    let mut out = String::new();
    for (key, value) in std::iter::once(("KEY", "VALUE")).chain(rows) {
        out.push_str(&format!("{:<width$}{}\n", key, value, width = width));
    }
    out
}

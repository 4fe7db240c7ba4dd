//! Plain-text matrix format used for affine transforms.
//!
//! Rows are newline separated and values space separated. Parsing is more
//! lenient: commas also separate values, `#` starts a comment and blank
//! lines are skipped.

use crate::errors::MatrixParseError;
use nalgebra::DMatrix;

/// Renders a matrix as text, one row per line.
#[must_use]
pub fn matrix_to_text(matrix: &DMatrix<f64>) -> String {
    let mut text = String::new();
    for row in matrix.row_iter() {
        let line: Vec<String> = row.iter().map(ToString::to_string).collect();
        text.push_str(&line.join(" "));
        text.push('\n');
    }
    text
}

/// Parses matrix text.
///
/// Every non-blank row must have the same number of columns as the first.
/// Empty input yields a 0x0 matrix.
pub fn text_to_matrix(text: &str) -> Result<DMatrix<f64>, MatrixParseError> {
    let mut rows: Vec<Vec<f64>> = Vec::new();

    for (index, raw_line) in text.lines().enumerate() {
        let line_no = index + 1;
        let content = raw_line.split('#').next().unwrap_or_default();
        let tokens: Vec<&str> = content
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            continue;
        }

        let row = tokens
            .iter()
            .map(|token| {
                token.parse::<f64>().map_err(|_| MatrixParseError::NonNumeric {
                    line: line_no,
                    token: (*token).to_string(),
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;

        if let Some(first) = rows.first() {
            if first.len() != row.len() {
                return Err(MatrixParseError::RaggedRow {
                    line: line_no,
                    expected: first.len(),
                    found: row.len(),
                });
            }
        }
        rows.push(row);
    }

    let ncols = rows.first().map_or(0, Vec::len);
    let nrows = rows.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Ok(DMatrix::from_row_slice(nrows, ncols, &flat))
}

//! Minimal CSV writer (RFC 4180 quoting).

use std::io::{self, Write};

const SEP: char = ',';

fn needs_quotes(field: &str) -> bool {
    field.contains(SEP) || field.contains('"') || field.contains('\n') || field.contains('\r')
}

/// Write a single CSV row to any writer.
pub fn write_row<W, S>(mut w: W, row: &[S]) -> io::Result<()>
where
    W: Write,
    S: AsRef<str>,
{
    let mut first = true;
    for cell in row {
        let cell = cell.as_ref();
        if !first {
            write!(w, "{}", SEP)?;
        } else {
            first = false;
        }
        if needs_quotes(cell) {
            let escaped = cell.replace('"', "\"\"");
            write!(w, "\"{}\"", escaped)?;
        } else {
            write!(w, "{}", cell)?;
        }
    }
    writeln!(w)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(row: &[&str]) -> String {
        let mut buf = Vec::new();
        write_row(&mut buf, row).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_plain_row() {
        assert_eq!(render(&["Alice", "Eng"]), "Alice,Eng\n");
    }

    #[test]
    fn test_quotes_delimiters_and_newlines() {
        assert_eq!(render(&["Smith, John", "PM"]), "\"Smith, John\",PM\n");
        assert_eq!(render(&["say \"hi\""]), "\"say \"\"hi\"\"\"\n");
        assert_eq!(render(&["line\nbreak", "x\ry"]), "\"line\nbreak\",\"x\ry\"\n");
    }

    #[test]
    fn test_empty_cells() {
        assert_eq!(render(&["", "b", ""]), ",b,\n");
    }
}

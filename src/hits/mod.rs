//! Similarity hits: the all-vs-all protein search output consumed by the
//! ortholog and paralog builders.

use color_eyre::eyre::{eyre, Report, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

/// One similarity hit. Tab-separated, 12 columns, `#` comments tolerated.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Hit {
    pub query: String,
    pub subject: String,
    /// Percent identity, 0..100.
    pub ident: f64,
    pub alen: i64,
    pub mismatches: i64,
    pub gap_openings: i64,
    pub qstart: i64,
    pub qend: i64,
    pub sstart: i64,
    pub send: i64,
    pub evalue: f64,
    pub bit_score: f64,
}

impl FromStr for Hit {
    type Err = Report;

    fn from_str(line: &str) -> Result<Self, Report> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 12 {
            return Err(eyre!("Expected 12 tab-separated columns, found {}", fields.len()));
        }

        Ok(Hit {
            query: fields[0].to_string(),
            subject: fields[1].to_string(),
            ident: fields[2].parse()?,
            alen: fields[3].parse()?,
            mismatches: fields[4].parse()?,
            gap_openings: fields[5].parse()?,
            qstart: fields[6].parse()?,
            qend: fields[7].parse()?,
            sstart: fields[8].parse()?,
            send: fields[9].parse()?,
            evalue: fields[10].parse()?,
            bit_score: fields[11].parse()?,
        })
    }
}

/// Read a similarity hits file, one hit per line.
pub fn read_hits(path: &Path) -> Result<Vec<Hit>, Report> {
    let file = File::open(path).wrap_err_with(|| eyre!("Failed to read hits: {path:?}"))?;

    let mut hits = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let hit: Hit =
            line.parse().wrap_err_with(|| format!("Malformed hit row in {path:?}: {line}"))?;
        hits.push(hit);
    }

    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::{Report, Result};
    use std::io::Write;

    pub(super) const LINE: &str = "A_001\tB_001\t98.5\t300\t4\t0\t1\t300\t1\t300\t1e-50\t550.0";

    #[test]
    fn parse_hit_line() -> Result<(), Report> {
        let hit: Hit = LINE.parse()?;
        assert_eq!(hit.query, "A_001");
        assert_eq!(hit.subject, "B_001");
        assert_eq!(hit.ident, 98.5);
        assert_eq!(hit.alen, 300);
        assert_eq!(hit.evalue, 1e-50);
        Ok(())
    }

    #[test]
    fn truncated_row_is_fatal() {
        assert!("A_001\tB_001\t98.5".parse::<Hit>().is_err());
    }

    #[test]
    fn comments_and_blanks_are_skipped() -> Result<(), Report> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hits.tsv");
        let mut file = File::create(&path)?;
        writeln!(file, "# similarity search output")?;
        writeln!(file)?;
        writeln!(file, "{LINE}")?;

        let hits = read_hits(&path)?;
        assert_eq!(hits.len(), 1);
        Ok(())
    }
}

use std::io::{self, Write};

use crate::health::HealthStatus;

/// Print rows in a tabular format to the provided writer.
pub fn print_rows<W: Write>(columns: &[String], rows: &[Vec<String>], w: &mut W) -> io::Result<()> {
    if rows.is_empty() {
        return writeln!(w, "(0 rows)");
    }
    let index_width = rows.len().to_string().len();
    let col_widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let max_val = rows
                .iter()
                .map(|r| r.get(i).map(|v| v.len()).unwrap_or(0))
                .max()
                .unwrap_or(0);
            std::cmp::max(c.len(), max_val)
        })
        .collect();

    let mut header = format!("{:>width$}", "", width = index_width);
    for (c, w_width) in columns.iter().zip(col_widths.iter()) {
        header.push_str(&format!(" {:<width$}", c, width = w_width));
    }
    writeln!(w, "{}", header.trim_end())?;

    for (i, row) in rows.iter().enumerate() {
        let mut line = format!("{:>width$}", i, width = index_width);
        for (j, w_width) in col_widths.iter().enumerate() {
            let val = row.get(j).map(String::as_str).unwrap_or("");
            line.push_str(&format!(" {:<width$}", val, width = w_width));
        }
        writeln!(w, "{}", line.trim_end())?;
    }
    writeln!(w, "({} rows)", rows.len())
}

/// Print one line per cluster followed by its hosts.
pub fn print_health<W: Write>(statuses: &[HealthStatus], w: &mut W) -> io::Result<()> {
    for status in statuses {
        writeln!(
            w,
            "{} {} ({}/{} hosts online)",
            status.cluster_id, status.state, status.online_hosts, status.total_hosts
        )?;
        for host in &status.hosts {
            let mark = if host.online { "up" } else { "down" };
            writeln!(w, "  {:<4} {}", mark, host.host)?;
        }
    }
    writeln!(w, "({} clusters)", statuses.len())
}

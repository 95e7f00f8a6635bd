//! CSV serialization of zonal statistics tables.
//!
//! One row per zone in the order given, with the header
//! `zone,count,mean,std,majority,min,max`.

use std::io::Write;

use floodline_pipeline::zonal::ZoneSummary;

use crate::ExportError;

/// Write `table` as CSV to `writer`.
///
/// # Errors
///
/// Returns [`ExportError::Csv`] if a row cannot be written and
/// [`ExportError::Io`] if the final flush fails.
pub fn write_zonal_table<W: Write>(table: &[ZoneSummary], writer: W) -> Result<W, ExportError> {
    let mut csv = csv::Writer::from_writer(writer);
    for summary in table {
        csv.serialize(summary)?;
    }
    csv.into_inner().map_err(|e| ExportError::Io(e.into_error()))
}

/// Render `table` as a CSV string.
///
/// # Errors
///
/// Propagates [`write_zonal_table`] errors.
pub fn zonal_table_to_csv(table: &[ZoneSummary]) -> Result<String, ExportError> {
    let bytes = write_zonal_table(table, Vec::new())?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn summary(zone: u32, mean: f64) -> ZoneSummary {
        ZoneSummary {
            zone,
            count: 4,
            mean,
            std: 0.5,
            majority: 2.0,
            min: 1.0,
            max: 3.0,
        }
    }

    #[test]
    fn header_and_rows() {
        let csv = zonal_table_to_csv(&[summary(1, 2.0), summary(7, 2.25)]).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "zone,count,mean,std,majority,min,max");
        assert_eq!(lines[1], "1,4,2.0,0.5,2.0,1.0,3.0");
        assert_eq!(lines[2], "7,4,2.25,0.5,2.0,1.0,3.0");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn empty_table_is_empty_output() {
        assert_eq!(zonal_table_to_csv(&[]).unwrap(), "");
    }

    #[test]
    fn reads_back_with_csv_reader() {
        let csv = zonal_table_to_csv(&[summary(3, 1.5)]).unwrap();
        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        let rows: Vec<ZoneSummary> = reader.deserialize().map(Result::unwrap).collect();
        assert_eq!(rows, vec![summary(3, 1.5)]);
    }
}

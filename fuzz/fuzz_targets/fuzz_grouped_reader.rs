#![no_main]

use apt_pipeline::{GroupedRecord, Reader, TableKind};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    for kind in [TableKind::Posteriors, TableKind::Summaries, TableKind::Scores] {
        let reader = Reader::new(Cursor::new(data), kind);

        // Iterate all records - should never panic
        for result in reader.take(1000) {
            match result {
                Ok(record) => {
                    let _ = record.probeset_id();
                    let _ = record.line_count();
                    if let GroupedRecord::Summary(summary) = &record {
                        let _ = summary.samples.len();
                    }
                }
                Err(err) => {
                    let _ = err.to_string();
                }
            }
        }
    }
});

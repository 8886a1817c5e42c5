use std::{fs, io::Write};

use apt_pipeline::{
    GroupedRecord, Reader, TableKind,
    records::{PosteriorRecord, SummaryRecord},
};
use flate2::{Compression, write::GzEncoder};
use tempfile::tempdir;

const SUMMARY: &str = "#%affymetrix-algorithm-name=summary\n\
                       probeset_id\tS1.CEL\tS2.CEL\tS3.CEL\n\
                       AFFX-NP-00001-A\t10\t11\t12\n\
                       AX-100-A\t1500.1\t1600.2\t1700.3\n\
                       AX-100-B\t900.5\t910.5\t920.5\n\
                       AX-200-A\t300.0\t310.0\t320.0\n\
                       AX-200-B\t800.0\t810.0\t820.0\n\
                       AFFX-NP-00002-B\t13\t14\t15\n\
                       AX-300-A\t111\t222\t333\n";

#[test]
fn summaries_from_gzip_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("AxiomGT1.summary.txt.gz");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(SUMMARY.as_bytes()).unwrap();
    fs::write(&path, encoder.finish().unwrap()).unwrap();

    let records: Vec<GroupedRecord> = Reader::open(&path, TableKind::Summaries)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    let ids: Vec<_> = records.iter().map(GroupedRecord::probeset_id).collect();
    assert_eq!(ids, vec!["AX-100", "AX-200", "AX-300"]);
    assert_eq!(
        records.iter().map(GroupedRecord::line_count).collect::<Vec<_>>(),
        vec![2, 2, 1]
    );

    let GroupedRecord::Summary(SummaryRecord {
        signals, samples, ..
    }) = &records[1]
    else {
        panic!("expected summary record");
    };
    assert_eq!(signals[&'B'], "800.0\t810.0\t820.0");
    assert_eq!(samples.len(), 3);
    assert_eq!(samples[2], "S3.CEL");
}

#[test]
fn posteriors_file_with_mixed_ploidy() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("AxiomGT1.snp-posteriors.txt");
    fs::write(
        &path,
        "#%SnpPosteriorFormatVer=1.0\n\
         id\tBB\tAB\tAA\tCV\n\
         AX-11086525\t0.1,0.2\t0.3,0.4\t0.5,0.6\t0.7\n\
         AX-11086526:1\t1.1\t1.2\t1.3\t1.4\n\
         AX-11086526:2\t2.1\t2.2\t2.3\t2.4\n\
         \n",
    )
    .unwrap();

    let records: Vec<_> = Reader::open(&path, TableKind::Posteriors)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(records.len(), 2);

    assert_eq!(
        records[0],
        GroupedRecord::Posterior(PosteriorRecord {
            probeset_id: "AX-11086525".to_string(),
            params: [("2".to_string(), "0.1,0.2\t0.3,0.4\t0.5,0.6\t0.7".to_string())]
                .into_iter()
                .collect(),
        })
    );
    let GroupedRecord::Posterior(haploid) = &records[1] else {
        panic!("expected posterior record");
    };
    assert_eq!(haploid.params["1"], "1.1\t1.2\t1.3\t1.4");
    assert_eq!(haploid.params["2"], "2.1\t2.2\t2.3\t2.4");
}

#[test]
fn reader_restarts_by_reopening() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scores.txt");
    fs::write(&path, "probeset_id\tS1\nAX-1\t0.5\nAX-2\t0.7\n").unwrap();

    for _ in 0..2 {
        let count = Reader::open(&path, TableKind::Scores).unwrap().count();
        assert_eq!(count, 2);
    }
}

#[test]
fn parse_error_reports_line_and_text() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.posteriors.txt");
    fs::write(&path, "#c\nid\tBB\nAX-1:1\ta\nAX-1:1:9\tb\n").unwrap();

    let results: Vec<_> = Reader::open(&path, TableKind::Posteriors).unwrap().collect();
    assert_eq!(results.len(), 1);
    let err = results[0].as_ref().unwrap_err();
    assert_eq!(err.line, 4);
    assert_eq!(err.raw, "AX-1:1:9\tb");
    assert!(err.to_string().starts_with("line 4:"));
}

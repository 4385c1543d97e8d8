//! End-to-end pipeline runs on packages built in the test.

use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use dexpack_core::dex::DexMode;
use dexpack_core::{
    AssetModules, NoTransform, PackError, PipelineOptions, RepackOptions, Result, Transform,
    TransformContext, run,
};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const STORED: CompressionMethod = CompressionMethod::Stored;
const DEFLATED: CompressionMethod = CompressionMethod::Deflated;

fn write_zip(path: &Path, entries: &[(&str, &[u8], CompressionMethod)]) {
    let mut writer = ZipWriter::new(File::create(path).unwrap());
    for (name, data, method) in entries {
        let options = SimpleFileOptions::default().compression_method(*method);
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
}

fn read_zip(path: &Path) -> Vec<(String, CompressionMethod, Vec<u8>)> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut entry = archive.by_index(i).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (entry.name().to_string(), entry.compression(), data)
        })
        .collect()
}

fn sample_apk(dir: &Path) -> PathBuf {
    let apk = dir.join("app.apk");
    write_zip(
        &apk,
        &[
            ("classes.dex", b"primary", STORED),
            ("classes2.dex", b"secondary", DEFLATED),
            ("res/a.xml", b"<a/>", STORED),
            ("AndroidManifest.xml", b"<manifest/>", DEFLATED),
            ("META-INF/CERT.SF", b"sig", DEFLATED),
            ("META-INF/services/x", b"svc", DEFLATED),
            ("assets/feature/metadata.txt", b".canary_prefix Lfeature\n", DEFLATED),
            ("assets/feature/feature.dex", b"module", STORED),
        ],
    );
    apk
}

fn options(dir: &Path, input: PathBuf) -> PipelineOptions {
    PipelineOptions {
        input,
        output: dir.join("out.apk"),
        always_clean: true,
        ..PipelineOptions::default()
    }
}

/// Records what it saw and edits the package like a real optimizer would.
#[derive(Default)]
struct Recorder {
    dex_files: RefCell<Vec<String>>,
    metadata: RefCell<Vec<String>>,
}

impl Transform for Recorder {
    fn run(&self, ctx: &TransformContext<'_>) -> Result<()> {
        let mut seen: Vec<String> = walkdir::WalkDir::new(ctx.dex_dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                e.path()
                    .strip_prefix(ctx.dex_dir)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        seen.sort();
        *self.dex_files.borrow_mut() = seen;

        for path in ctx.module_metadata {
            self.metadata
                .borrow_mut()
                .push(fs::read_to_string(path).unwrap());
        }

        fs::write(ctx.dex_dir.join("classes2.dex"), b"optimized")?;
        fs::write(ctx.extracted_dir.join("new.txt"), b"added")?;
        Ok(())
    }
}

struct Failing;

impl Transform for Failing {
    fn run(&self, _ctx: &TransformContext<'_>) -> Result<()> {
        Err(PackError::Invalid("optimizer crashed".to_string()))
    }
}

#[test]
fn test_full_run_repacks_in_order_with_original_compression() {
    let dir = TempDir::new().unwrap();
    let opts = options(dir.path(), sample_apk(dir.path()));
    let recorder = Recorder::default();

    let report = run(&opts, &AssetModules, &recorder).unwrap();

    assert_eq!(report.dex_mode, DexMode::Api21);
    assert_eq!(report.modules, ["feature"]);
    assert_eq!(report.expanded_libs, 0);
    assert_eq!(
        *recorder.dex_files.borrow(),
        ["classes.dex", "classes2.dex", "feature/feature.dex"]
    );
    let metadata = recorder.metadata.borrow();
    assert_eq!(metadata.len(), 1);
    assert!(metadata[0].contains("\"canary_prefix\": \"Lfeature\""));

    let entries = read_zip(&opts.output);
    let names: Vec<&str> = entries.iter().map(|(n, _, _)| n.as_str()).collect();
    assert_eq!(
        names,
        [
            "AndroidManifest.xml",
            "classes.dex",
            "classes2.dex",
            "new.txt",
            "META-INF/services/x",
            "assets/feature/feature.dex",
            "assets/feature/metadata.txt",
            "res/a.xml",
        ]
    );

    let find = |name: &str| entries.iter().find(|(n, _, _)| n == name).unwrap();
    assert_eq!(find("classes.dex").1, STORED);
    assert_eq!(find("classes2.dex").1, DEFLATED);
    assert_eq!(find("classes2.dex").2, b"optimized");
    assert_eq!(find("res/a.xml").1, STORED);
    assert_eq!(find("assets/feature/feature.dex").1, STORED);
    assert_eq!(find("new.txt").1, DEFLATED);
}

#[test]
fn test_locator_ids_written_to_module_manifest() {
    let dir = TempDir::new().unwrap();
    let mut opts = options(dir.path(), sample_apk(dir.path()));
    opts.repack = RepackOptions {
        emit_locators: true,
        fast_repackage: false,
    };

    run(&opts, &AssetModules, &NoTransform).unwrap();

    let entries = read_zip(&opts.output);
    let (_, _, manifest) = entries
        .iter()
        .find(|(n, _, _)| n == "assets/feature/metadata.txt")
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(manifest),
        ".canary_prefix Lfeature\n.locator_id 1\n"
    );
}

#[test]
fn test_failed_transform_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let opts = options(dir.path(), sample_apk(dir.path()));

    let err = run(&opts, &AssetModules, &Failing).unwrap_err();

    assert!(matches!(err, PackError::Stage { stage: "transforming", .. }));
    assert!(err.to_string().contains("optimizer crashed"));
    assert!(!opts.output.exists());
}

#[test]
fn test_missing_primary_dex_aborts_before_output() {
    let dir = TempDir::new().unwrap();
    let apk = dir.path().join("broken.apk");
    write_zip(&apk, &[("classes2.dex", b"orphan", DEFLATED)]);
    let opts = options(dir.path(), apk);

    let err = run(&opts, &AssetModules, &NoTransform).unwrap_err();

    match err {
        PackError::Stage { stage, source } => {
            assert_eq!(stage, "unpacking dex files");
            assert!(matches!(*source, PackError::MissingPrimaryDex(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!opts.output.exists());
}

#[test]
fn test_corrupt_input_fails_extraction() {
    let dir = TempDir::new().unwrap();
    let apk = dir.path().join("corrupt.apk");
    fs::write(&apk, b"definitely not a zip").unwrap();

    let err = run(&options(dir.path(), apk), &AssetModules, &NoTransform).unwrap_err();

    assert!(matches!(err, PackError::Stage { stage: "extracting", .. }));
}

#[test]
fn test_repeated_runs_are_byte_identical() {
    let dir = TempDir::new().unwrap();
    let apk = sample_apk(dir.path());
    let first = PipelineOptions {
        output: dir.path().join("first.apk"),
        ..options(dir.path(), apk.clone())
    };
    let second = PipelineOptions {
        output: dir.path().join("second.apk"),
        ..options(dir.path(), apk)
    };

    run(&first, &AssetModules, &NoTransform).unwrap();
    run(&second, &AssetModules, &NoTransform).unwrap();

    assert_eq!(fs::read(&first.output).unwrap(), fs::read(&second.output).unwrap());
}

#[test]
fn test_bundle_dexes_return_to_base_dex() {
    let dir = TempDir::new().unwrap();
    let aab = dir.path().join("app.aab");
    write_zip(
        &aab,
        &[
            ("base/dex/classes.dex", b"p", DEFLATED),
            ("base/dex/classes2.dex", b"s", DEFLATED),
            ("base/manifest/AndroidManifest.xml", b"<m/>", DEFLATED),
        ],
    );
    let mut opts = options(dir.path(), aab);
    opts.output = dir.path().join("out.aab");

    run(&opts, &AssetModules, &NoTransform).unwrap();

    let names: Vec<String> = read_zip(&opts.output).into_iter().map(|(n, _, _)| n).collect();
    assert_eq!(
        names,
        [
            "base/dex/classes.dex",
            "base/dex/classes2.dex",
            "base/manifest/AndroidManifest.xml",
        ]
    );
}

#[test]
fn test_missing_input_is_reported() {
    let dir = TempDir::new().unwrap();
    let opts = options(dir.path(), dir.path().join("nope.apk"));

    let err = run(&opts, &AssetModules, &NoTransform).unwrap_err();

    assert!(matches!(err, PackError::Invalid(_)));
}

#[test]
fn test_subdir_package_survives_unchanged() {
    let dir = TempDir::new().unwrap();
    let apk = dir.path().join("legacy.apk");
    write_zip(
        &apk,
        &[
            ("classes.dex", b"primary", DEFLATED),
            (
                "assets/secondary-program-dex-jars/metadata.txt",
                b"secondary-3.dex 0 Lsecondary/dex03/Canary;\nsecondary-7.dex 0 Lsecondary/dex07/Canary;",
                DEFLATED,
            ),
            ("assets/secondary-program-dex-jars/secondary-3.dex", b"three", STORED),
            ("assets/secondary-program-dex-jars/secondary-7.dex", b"seven", STORED),
        ],
    );
    let opts = options(dir.path(), apk.clone());

    let report = run(&opts, &AssetModules, &NoTransform).unwrap();

    assert_eq!(report.dex_mode, DexMode::Subdir);
    assert!(report.modules.is_empty());
    let mut before = read_zip(&apk);
    let mut after = read_zip(&opts.output);
    before.sort_by(|a, b| a.0.cmp(&b.0));
    after.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(after, before);
}

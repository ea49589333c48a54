use std::fs;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use tempfile::tempdir;

use packstream::{
    CacheConfig, CacheReader, CacheWriter, CancellationToken, FileDocumentStream, FormatRegistry,
    HashingWhitespaceTokenizer, PackingConfig, SequencePacker, StopPolicy, StreamMap, TokenBatch,
    WeightedSampler, production_source,
};

fn write_corpus(root: &Path) {
    let web = root.join("web");
    let papers = root.join("papers");
    fs::create_dir_all(&web).unwrap();
    fs::create_dir_all(&papers).unwrap();
    for shard in 0..3 {
        let lines: String = (0..20)
            .map(|n| {
                let body = "w ".repeat(n % 7);
                format!("{{\"text\": \"web shard {shard} doc {n} {body}\"}}\n")
            })
            .collect();
        fs::write(web.join(format!("shard-{shard}.jsonl")), lines).unwrap();
    }
    for n in 0..10 {
        fs::write(
            papers.join(format!("paper-{n:02}.txt")),
            format!("abstract {n} {}", "p ".repeat(n * 3)),
        )
        .unwrap();
    }
}

fn batch_source(corpus: &Path) -> packstream::BatchSource {
    let registry = Arc::new(FormatRegistry::with_defaults());
    let mut streams: StreamMap<String> = IndexMap::new();
    streams.insert(
        "web".into(),
        Box::new(
            FileDocumentStream::from_root("web", corpus.join("web"), registry.clone()).unwrap(),
        ),
    );
    streams.insert(
        "papers".into(),
        Box::new(FileDocumentStream::from_root("papers", corpus.join("papers"), registry).unwrap()),
    );
    let sampler = WeightedSampler::new(streams, None, 9, StopPolicy::Skip).unwrap();
    let packer = SequencePacker::new(PackingConfig::new(8).with_batch_size(4)).unwrap();
    production_source(sampler, HashingWhitespaceTokenizer::default(), 4, packer).unwrap()
}

fn dir_cache_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("docs-"))
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("docs-")
            .trim_end_matches(".bin")
            .parse::<usize>()
            .unwrap()
    });
    names
}

#[test]
fn cache_round_trip_reproduces_packed_batches() {
    let corpus = tempdir().unwrap();
    write_corpus(corpus.path());
    let expected: Vec<TokenBatch> = batch_source(corpus.path())
        .filter(|batch| !matches!(batch, Ok(batch) if batch.is_empty()))
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(expected.len() > 5);

    let cache = tempdir().unwrap();
    let config = CacheConfig::new(cache.path()).with_num_tokens_per_file(64);
    let mut committed = Vec::new();
    let ledger = CacheWriter::create(config)
        .unwrap()
        .write_all(batch_source(corpus.path()), &CancellationToken::new(), |path| {
            committed.push(path.to_path_buf())
        })
        .unwrap();

    assert!(ledger.len() > 1);
    let ledger_names: Vec<String> = ledger.entries().iter().map(|e| e.file_name.clone()).collect();
    assert_eq!(ledger_names, dir_cache_files(cache.path()));
    assert_eq!(committed, ledger.file_paths(cache.path()));
    let expected_tokens: u64 = expected.iter().map(TokenBatch::num_tokens).sum();
    assert_eq!(ledger.total_tokens(), expected_tokens);

    let reader = CacheReader::open(cache.path()).unwrap().expect("ledger");
    reader.verify().unwrap();
    let replayed: Vec<TokenBatch> = reader.batches(false).collect::<Result<_, _>>().unwrap();
    assert_eq!(replayed, expected);

    let rows: usize = expected.iter().map(TokenBatch::num_rows).sum();
    assert_eq!(reader.batches(true).count(), rows);
}

#[test]
fn custom_extension_is_used_for_every_file() {
    let corpus = tempdir().unwrap();
    write_corpus(corpus.path());
    let cache = tempdir().unwrap();
    let config = CacheConfig::new(cache.path())
        .with_num_tokens_per_file(128)
        .with_file_extension(".tokens");
    let ledger = CacheWriter::create(config)
        .unwrap()
        .write_all(batch_source(corpus.path()), &CancellationToken::new(), |_| {})
        .unwrap();
    assert!(
        ledger
            .entries()
            .iter()
            .enumerate()
            .all(|(idx, entry)| entry.file_name == format!("docs-{idx}.tokens"))
    );
    CacheReader::open(cache.path()).unwrap().unwrap().verify().unwrap();
}

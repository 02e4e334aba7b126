//! Chunk and metadata benchmarks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use hyper::header::HeaderValue;
use hyper::HeaderMap;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tus_server::metadata;
use tus_server::{FileStore, ProtocolHandler, UploadRegistry};

fn benchmark_patch_sizes(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::TempDir::new().unwrap();
    let handler = rt.block_on(async {
        let store = FileStore::open(dir.path()).await.unwrap();
        ProtocolHandler::new(Arc::new(UploadRegistry::new()), Arc::new(store), "/files", u64::MAX)
    });

    let mut create = HeaderMap::new();
    create.insert("upload-defer-length", HeaderValue::from_static("1"));

    let mut group = c.benchmark_group("patch_sizes");

    for size in [1024, 64 * 1024, 1024 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(format!("{}_bytes", size), size, |b, &size| {
            let data = Bytes::from(vec![0u8; size]);
            b.to_async(&rt).iter(|| async {
                let response = handler.create(&create).await;
                let location = response.headers()["location"].to_str().unwrap().to_string();
                let id = location.rsplit('/').next().unwrap();

                let mut headers = HeaderMap::new();
                headers.insert(
                    "content-type",
                    HeaderValue::from_static("application/offset+octet-stream"),
                );
                headers.insert("upload-offset", HeaderValue::from_static("0"));
                black_box(handler.patch(id, &headers, data.clone()).await);
            });
        });
    }

    group.finish();
}

fn benchmark_metadata_decode(c: &mut Criterion) {
    let header = "filename d29ybGRfZG9taW5hdGlvbl9wbGFuLnBkZg==,filetype YXBwbGljYXRpb24vcGRm,\
                  size MTAyNDAw,broken !!!,checksum c2hhMjU2OmFiY2RlZg==";

    c.bench_function("metadata_decode", |b| {
        b.iter(|| black_box(metadata::decode(black_box(header))));
    });
}

criterion_group!(benches, benchmark_patch_sizes, benchmark_metadata_decode);
criterion_main!(benches);

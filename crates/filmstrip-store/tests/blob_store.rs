//! Behaviour shared by every `BlobStore` backend.

use std::sync::Arc;

use bytes::Bytes;
use filmstrip_core::AssetId;
use filmstrip_store::{BlobStore, FilmstripMeta, FsBlobStore, MemoryBlobStore};

async fn exercise(store: Arc<dyn BlobStore>) {
    let asset = AssetId::new("movie 42");

    assert!(store.read_meta(&asset).await.unwrap().is_none());

    let writes: Vec<_> = (0..8u32)
        .map(|index| {
            let store = Arc::clone(&store);
            let asset = asset.clone();
            tokio::spawn(async move {
                store
                    .write_frame(&asset, index * 3, Bytes::from(vec![index as u8; 16]))
                    .await
            })
        })
        .collect();
    for write in writes {
        write.await.unwrap().unwrap();
    }

    let meta = FilmstripMeta {
        width: 160,
        height: 90,
        is_complete: true,
        frame_count: 8,
    };
    store.write_meta(&asset, &meta).await.unwrap();

    assert_eq!(
        store.list_frames(&asset).await.unwrap(),
        vec![0, 3, 6, 9, 12, 15, 18, 21]
    );
    assert_eq!(store.read_meta(&asset).await.unwrap(), Some(meta));
    let frame = store.read_frame(&asset, 9).await.unwrap().unwrap();
    assert_eq!(frame.as_ref(), &[3u8; 16]);
    assert!(store.read_frame(&asset, 10).await.unwrap().is_none());

    store.delete_asset(&asset).await.unwrap();
    assert!(store.list_frames(&asset).await.unwrap().is_empty());
    assert!(store.read_meta(&asset).await.unwrap().is_none());
}

#[tokio::test]
async fn memory_store_contract() {
    exercise(Arc::new(MemoryBlobStore::new())).await;
}

#[tokio::test]
async fn fs_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    exercise(Arc::new(FsBlobStore::new(dir.path()))).await;
}

use catalog::NewAsset;
use common::AssetType;

use crate::support::{TestCatalog, scope};

async fn raw(cat: &TestCatalog, path: &str) -> i32 {
    cat.registry
        .insert(NewAsset::local(scope(), AssetType::Novatel, path))
        .await
        .unwrap()
}

mod single {
    use super::*;

    #[tokio::test]
    async fn derived_child_counts_as_link() {
        let cat = TestCatalog::open().await;
        let parent_id = raw(&cat, "/n1").await;
        assert!(!cat.registry.link_exists(parent_id, AssetType::Rinex).await.unwrap());

        let parent = cat.registry.get(parent_id).await.unwrap();
        cat.registry
            .insert(NewAsset::derived(&parent, AssetType::Rinex).with_local_path("/n1.24o"))
            .await
            .unwrap();

        assert!(cat.registry.link_exists(parent_id, AssetType::Rinex).await.unwrap());
        assert!(!cat.registry.link_exists(parent_id, AssetType::Kin).await.unwrap());

        let children = cat
            .registry
            .children_of(parent_id, Some(AssetType::Rinex))
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].parent_id, Some(parent_id));
    }

    #[tokio::test]
    async fn recorded_marker_counts_as_link() {
        let cat = TestCatalog::open().await;
        let parent_id = raw(&cat, "/n1").await;

        cat.registry
            .record_link(parent_id, AssetType::GnssObsTdb)
            .await
            .unwrap();
        cat.registry
            .record_link(parent_id, AssetType::GnssObsTdb)
            .await
            .unwrap();

        assert!(
            cat.registry
                .link_exists(parent_id, AssetType::GnssObsTdb)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn marker_for_id_12_does_not_cover_id_2() {
        let cat = TestCatalog::open().await;
        let mut ids = Vec::new();
        for i in 0..12 {
            ids.push(raw(&cat, &format!("/n{i}")).await);
        }
        let twelve = ids[11];
        assert_eq!(twelve, 12);

        cat.registry.record_link(twelve, AssetType::Rinex).await.unwrap();

        assert!(cat.registry.link_exists(12, AssetType::Rinex).await.unwrap());
        assert!(!cat.registry.link_exists(2, AssetType::Rinex).await.unwrap());
        assert!(!cat.registry.link_exists(1, AssetType::Rinex).await.unwrap());
    }
}

mod batch {
    use super::*;

    #[tokio::test]
    async fn batch_marker_covers_every_member() {
        let cat = TestCatalog::open().await;
        let a = raw(&cat, "/a").await;
        let b = raw(&cat, "/b").await;
        let c = raw(&cat, "/c").await;
        let outsider = raw(&cat, "/d").await;

        cat.registry
            .record_batch_link(&scope(), AssetType::Novatel, AssetType::ShotData, &[c, a, b])
            .await
            .unwrap();

        for id in [a, b, c] {
            assert!(cat.registry.link_exists(id, AssetType::ShotData).await.unwrap());
        }
        assert!(
            !cat.registry
                .link_exists(outsider, AssetType::ShotData)
                .await
                .unwrap()
        );
        assert!(
            cat.registry
                .batch_link_exists(&scope(), AssetType::Novatel, AssetType::ShotData, &[a, b, c])
                .await
                .unwrap()
        );
        assert!(
            !cat.registry
                .batch_link_exists(&scope(), AssetType::Novatel, AssetType::ShotData, &[a, b])
                .await
                .unwrap()
        );
    }
}

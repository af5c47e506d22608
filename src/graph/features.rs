//! Feature storage on top of the store primitives
//!
//! Free function rather than a `GraphStore` method: mapping a feature bag
//! onto label nodes is application logic, and every store gets it for free.

use std::collections::BTreeMap;

use serde_json::Value;

use super::GraphStore;
use crate::collaborators::FeatureBag;
use crate::error::Result;
use crate::storage::{EdgeKind, EdgeRecord, LabelKind};

/// Attach `bag` to the image keyed `key`.
///
/// Returns `Ok(false)` when there is no such image or the bag is empty.
/// Label nodes and image->label edges are merged, so storing the same bag
/// twice changes nothing.
pub fn store_image_features(store: &mut dyn GraphStore, key: &str, bag: &FeatureBag) -> Result<bool> {
    if bag.is_empty() {
        tracing::warn!("No features to store for {}", key);
        return Ok(false);
    }
    let image_id = match store.find_image_by_key(key)? {
        Some(image) => image.id,
        None => return Ok(false),
    };

    // Scalars on the image node
    let mut props: BTreeMap<String, Value> = BTreeMap::new();
    if let Some(basic) = &bag.basic {
        props.insert("basic_width".into(), Value::from(basic.width));
        props.insert("basic_height".into(), Value::from(basic.height));
        props.insert("basic_aspect_ratio".into(), Value::from(basic.aspect_ratio as f64));
        props.insert("basic_orientation".into(), Value::from(basic.orientation.clone()));
    }
    if let Some(color) = &bag.color {
        if let Some(hex) = &color.color_hex {
            props.insert("color_hex".into(), Value::from(hex.clone()));
        }
        if let Some(category) = &color.brightness_category {
            props.insert("brightness".into(), Value::from(category.clone()));
        }
    }
    let features_json = serde_json::to_string(bag)?;
    store.set_image_properties(image_id, props, Some(features_json))?;

    for tag in &bag.tags {
        let tag_id = store.merge_label_node(LabelKind::Tag, tag)?;
        if let Some((category, _)) = tag.split_once(':') {
            let category_id = store.merge_label_node(LabelKind::Category, category)?;
            store.merge_edge(EdgeRecord::label(tag_id, category_id, EdgeKind::InCategory))?;
        }
        store.merge_edge(EdgeRecord::label(image_id, tag_id, EdgeKind::HasTag))?;
    }

    if let Some(color) = &bag.color {
        for name in &color.dominant_colors {
            let color_id = store.merge_label_node(LabelKind::Color, name)?;
            store.merge_edge(EdgeRecord::label(image_id, color_id, EdgeKind::HasColor))?;
        }
    }

    for object in &bag.objects {
        let object_id = store.merge_label_node(LabelKind::Object, &object.label)?;
        store.merge_edge(EdgeRecord::contains(image_id, object_id, object.confidence))?;
    }

    if let Some(exif) = &bag.exif {
        if let Some(model) = &exif.camera_model {
            let camera_id = store.merge_label_node(LabelKind::Camera, model)?;
            store.merge_edge(EdgeRecord::label(image_id, camera_id, EdgeKind::TakenWith))?;
        }
        if let Some(lens) = &exif.lens {
            let lens_id = store.merge_label_node(LabelKind::Lens, lens)?;
            store.merge_edge(EdgeRecord::label(image_id, lens_id, EdgeKind::UsedLens))?;
        }
    }

    Ok(true)
}

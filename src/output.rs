//! Renders query results as a GeoJSON feature collection.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use geojson::{FeatureCollection, Geometry, JsonObject, Value};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde_json::json;

use crate::dictionary::TagDictionary;
use crate::feature::{Element, Feature};
use crate::{Error, Result};

/// Nodes become Points, ways LineStrings and relations the polygon of
/// their bounding box. Tags are decoded into properties, next to `@type`.
pub fn to_feature_collection(
    features: &[Feature],
    dictionary: &TagDictionary,
) -> FeatureCollection {
    FeatureCollection {
        bbox: None,
        features: features.par_iter().map(|feature| to_geojson(feature, dictionary)).collect(),
        foreign_members: None,
    }
}

/// Write the features as one GeoJSON document.
pub fn write_geojson(path: &Path, features: &[Feature], dictionary: &TagDictionary) -> Result<()> {
    let collection = to_feature_collection(features, dictionary);
    let file = File::create(path).map_err(Error::io(path))?;
    serde_json::to_writer(BufWriter::new(file), &collection)?;
    Ok(())
}

fn to_geojson(feature: &Feature, dictionary: &TagDictionary) -> geojson::Feature {
    let geometry = match feature {
        Feature::Node(node) => Value::Point(vec![node.lon as f64, node.lat as f64]),
        Feature::Way(way) => Value::LineString(
            way.nodes.iter().map(|node| vec![node.lon as f64, node.lat as f64]).collect(),
        ),
        Feature::Relation(relation) => {
            let bound = relation.bound();
            let (min, max) = (bound.min(), bound.max());
            Value::Polygon(vec![vec![
                vec![min.x, min.y],
                vec![max.x, min.y],
                vec![max.x, max.y],
                vec![min.x, max.y],
                vec![min.x, min.y],
            ]])
        }
    };

    let mut properties = JsonObject::new();
    properties.insert("@type".to_string(), json!(feature.kind().dir_name()));
    for decoded in dictionary.decode(feature.tags()) {
        match decoded {
            Some((key, value)) => {
                properties.insert(key.to_string(), json!(value));
            }
            None => log::warn!(
                "{} {} carries a tag the dictionary cannot resolve",
                feature.kind(),
                feature.id()
            ),
        }
    }

    geojson::Feature {
        bbox: None,
        geometry: Some(Geometry::new(geometry)),
        id: Some(geojson::feature::Id::Number(feature.id().into())),
        properties: Some(properties),
        foreign_members: None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::feature::{Node, Way, WayNode};
    use crate::tags::EncodedTags;

    #[test]
    fn features_serialize_with_decoded_tags() {
        let mut dictionary = TagDictionary::default();
        dictionary.add([("amenity", "bench"), ("seats", "3")]).unwrap();
        dictionary.finalize();

        let node = Feature::Node(Node {
            id: 1,
            lon: 13.5,
            lat: 52.5,
            tags: dictionary.encode([("amenity", "bench"), ("seats", "3")]).unwrap(),
            way_ids: vec![],
            relation_ids: vec![],
        });
        let way = Feature::Way(Way {
            id: 2,
            tags: EncodedTags::default(),
            nodes: vec![
                WayNode { id: 1, lon: 0.0, lat: 0.0 },
                WayNode { id: 3, lon: 1.0, lat: 1.0 },
            ],
            relation_ids: vec![],
        });

        let collection = to_feature_collection(&[node, way], &dictionary);
        let value = serde_json::to_value(&collection).unwrap();
        assert_eq!(value["type"], "FeatureCollection");
        assert_eq!(value["features"][0]["geometry"]["type"], "Point");
        assert_eq!(value["features"][0]["geometry"]["coordinates"], json!([13.5, 52.5]));
        assert_eq!(value["features"][0]["properties"]["amenity"], "bench");
        assert_eq!(value["features"][0]["properties"]["seats"], "3");
        assert_eq!(value["features"][0]["properties"]["@type"], "node");
        assert_eq!(value["features"][1]["geometry"]["type"], "LineString");
        assert_eq!(
            value["features"][1]["geometry"]["coordinates"],
            json!([[0.0, 0.0], [1.0, 1.0]])
        );
    }
}

use graticule::{
    Element, Feature, FeatureKind, Graticule, GridReader, IndexConfig, Query, RawElement, RawNode,
    RawRelation, RawWay, WayNode,
};
use steppe::NoProgress;
use tempfile::TempDir;

fn tags(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn node(id: u64, lon: f64, lat: f64, pairs: &[(&str, &str)]) -> RawElement {
    RawElement::Node(RawNode { id, lon, lat, tags: tags(pairs) })
}

fn way(id: u64, node_ids: &[u64], pairs: &[(&str, &str)]) -> RawElement {
    RawElement::Way(RawWay { id, node_ids: node_ids.to_vec(), tags: tags(pairs) })
}

fn relation(
    id: u64,
    node_ids: &[u64],
    way_ids: &[u64],
    relation_ids: &[u64],
    pairs: &[(&str, &str)],
) -> RawElement {
    RawElement::Relation(RawRelation {
        id,
        node_ids: node_ids.to_vec(),
        way_ids: way_ids.to_vec(),
        relation_ids: relation_ids.to_vec(),
        tags: tags(pairs),
    })
}

struct IndexHandle {
    engine: Graticule,
    reader: GridReader,
    #[allow(unused)]
    tempdir: TempDir,
}

fn build_index(elements: Vec<RawElement>) -> IndexHandle {
    let tempdir = tempfile::tempdir().unwrap();
    let engine = Graticule::new(IndexConfig::new(tempdir.path()));
    let mut source = elements;
    engine.import(&mut source, &|| false, &NoProgress).unwrap();
    let reader = engine.open().unwrap();
    IndexHandle { engine, reader, tempdir }
}

fn run(handle: &IndexHandle, query: &str) -> Vec<u64> {
    let query = Query::parse(query, handle.reader.dictionary()).unwrap();
    let mut ids: Vec<u64> =
        query.execute(&handle.reader).unwrap().iter().map(|feature| feature.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Three nodes in one cell, filtered by tag equality and a range filter.
#[test]
fn bench_queries() {
    let handle = build_index(vec![
        node(1, 0.01, 0.01, &[("amenity", "bench")]),
        node(2, 0.02, 0.02, &[("amenity", "bench"), ("seats", "3")]),
        node(3, 0.03, 0.03, &[("amenity", "restaurant")]),
    ]);

    assert_eq!(run(&handle, "bbox(0,0,0.1,0.1).nodes{ amenity=bench }"), vec![1, 2]);
    assert_eq!(run(&handle, "bbox(0,0,0.1,0.1).nodes{ amenity=bench AND seats>=3 }"), vec![2]);
    assert_eq!(run(&handle, "bbox(0,0,0.1,0.1).nodes{ amenity=restaurant }"), vec![3]);
    assert_eq!(run(&handle, "bbox(0,0,0.1,0.1).nodes{ amenity=* }"), vec![1, 2, 3]);
    assert_eq!(run(&handle, "bbox(0,0,0.1,0.1).nodes{ seats!=* }"), vec![1, 3]);
}

#[test]
fn bbox_clips_by_geometry_not_just_cells() {
    let handle = build_index(vec![
        node(1, 0.01, 0.01, &[("amenity", "bench")]),
        node(2, 0.08, 0.08, &[("amenity", "bench")]),
        node(3, 0.55, 0.55, &[("amenity", "bench")]),
    ]);

    // both nodes of cell (0, 0) share the cell, only one is in the bbox
    assert_eq!(run(&handle, "bbox(0,0,0.05,0.05).nodes{ amenity=bench }"), vec![1]);
    // a bbox spanning several cells picks up the far node too
    assert_eq!(run(&handle, "bbox(0,0,0.6,0.6).nodes{ amenity=bench }"), vec![1, 2, 3]);
}

#[test]
fn natural_order_range_filters() {
    let handle = build_index(vec![
        node(1, 0.01, 0.01, &[("maxspeed", "30")]),
        node(2, 0.02, 0.02, &[("maxspeed", "50")]),
        node(3, 0.03, 0.03, &[("maxspeed", "100")]),
        node(4, 0.04, 0.04, &[("amenity", "bench")]),
    ]);

    // byte order would put "100" first; natural order keeps it last
    assert_eq!(run(&handle, "bbox(0,0,0.1,0.1).nodes{ maxspeed>30 }"), vec![2, 3]);
    assert_eq!(run(&handle, "bbox(0,0,0.1,0.1).nodes{ maxspeed<=50 }"), vec![1, 2]);
    assert_eq!(run(&handle, "bbox(0,0,0.1,0.1).nodes{ maxspeed<40 }"), vec![1]);
    // nodes without the key never satisfy an inequality
    assert_eq!(run(&handle, "bbox(0,0,0.1,0.1).nodes{ maxspeed!=30 }"), vec![2, 3]);
}

fn street_furniture() -> Vec<RawElement> {
    vec![
        node(1, 0.01, 0.01, &[("amenity", "bench")]),
        node(2, 0.05, 0.05, &[]),
        node(3, 0.15, 0.05, &[]),
        node(4, 0.35, 0.35, &[]),
        node(5, 0.36, 0.36, &[]),
        // spans cells (0,0) and (1,0)
        way(10, &[1, 2, 3], &[("highway", "path")]),
        way(11, &[4, 5], &[("highway", "track")]),
        relation(20, &[], &[10], &[], &[("type", "route")]),
        relation(21, &[1], &[], &[20], &[("type", "superroute")]),
    ]
}

#[test]
fn ways_split_into_every_touched_cell() {
    let handle = build_index(street_furniture());
    // found through either of its cells
    assert_eq!(run(&handle, "bbox(0,0,0.09,0.09).ways{ highway=path }"), vec![10]);
    assert_eq!(run(&handle, "bbox(0.11,0,0.19,0.09).ways{ highway=path }"), vec![10]);
    assert_eq!(run(&handle, "bbox(0,0,1,1).ways{ highway=* }"), vec![10, 11]);
}

#[test]
fn sub_statements_follow_references() {
    let handle = build_index(street_furniture());

    // nodes that belong to a path
    assert_eq!(run(&handle, "bbox(0,0,1,1).nodes{ .ways{ highway=path } }"), vec![1, 2, 3]);
    // ways that belong to a route relation
    assert_eq!(run(&handle, "bbox(0,0,1,1).ways{ .relations{ type=route } }"), vec![10]);
    // relations owning a bench node
    assert_eq!(run(&handle, "bbox(0,0,1,1).relations{ .nodes{ amenity=bench } }"), vec![21]);
    // ways whose route is itself part of a superroute
    assert_eq!(
        run(&handle, "bbox(0,0,1,1).ways{ .relations{ .relations{ type=superroute } } }"),
        vec![10]
    );
    // child side of the relation hierarchy
    assert_eq!(
        run(&handle, "bbox(0,0,1,1).relations{ .child_relations{ type=route } }"),
        vec![21]
    );
    // parent side
    assert_eq!(
        run(&handle, "bbox(0,0,1,1).relations{ .relations{ type=superroute } }"),
        vec![20]
    );
    // nodes of a way that a route contains
    assert_eq!(
        run(&handle, "bbox(0,0,1,1).nodes{ .ways{ .relations{ type=route } } }"),
        vec![1, 2, 3]
    );
}

#[test]
fn combined_tag_and_sub_statement_filters() {
    let handle = build_index(street_furniture());
    assert_eq!(
        run(&handle, "bbox(0,0,1,1).nodes{ amenity=bench AND .ways{ highway=path } }"),
        vec![1]
    );
    assert_eq!(
        run(&handle, "bbox(0,0,1,1).nodes{ amenity=bench OR .ways{ highway=track } }"),
        vec![1, 4, 5]
    );
    assert_eq!(
        run(&handle, "bbox(0,0,1,1).nodes{ !.ways{ highway=* } }"),
        Vec::<u64>::new()
    );
}

#[test]
fn unknown_strings_give_empty_results() {
    let handle = build_index(street_furniture());
    assert_eq!(run(&handle, "bbox(0,0,1,1).nodes{ building=yes }"), Vec::<u64>::new());
    assert_eq!(run(&handle, "bbox(0,0,1,1).ways{ highway=motorway }"), Vec::<u64>::new());
}

#[test]
fn multiple_statements_concatenate() {
    let handle = build_index(street_furniture());
    assert_eq!(
        run(
            &handle,
            "bbox(0,0,1,1).nodes{ amenity=bench }\n\
             bbox(0,0,1,1).ways{ highway=track }",
        ),
        vec![1, 11]
    );
}

#[test]
fn query_nodes_resolves_way_nodes() {
    let handle = build_index(street_furniture());
    let ways = run(&handle, "bbox(0,0,1,1).ways{ highway=path }");
    assert_eq!(ways, vec![10]);

    let stream = handle.reader.query_nodes(&[
        WayNode { id: 1, lon: 0.01, lat: 0.01 },
        WayNode { id: 3, lon: 0.15, lat: 0.05 },
        WayNode { id: 999, lon: 0.01, lat: 0.01 },
    ]);
    let mut ids: Vec<u64> = Vec::new();
    for batch in stream {
        let (_, features) = batch.unwrap();
        ids.extend(features.iter().map(|feature| feature.id()));
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 3]);
}

#[test]
fn reverse_references_are_filled() {
    let handle = build_index(street_furniture());
    let query = Query::parse("bbox(0,0,1,1).nodes{ amenity=bench }", handle.reader.dictionary());
    let features = query.unwrap().execute(&handle.reader).unwrap();
    let Feature::Node(bench) = &features[0] else { panic!("expected a node") };
    assert_eq!(bench.way_ids, vec![10]);
    assert_eq!(bench.relation_ids, vec![21]);

    let query = Query::parse("bbox(0,0,1,1).ways{ highway=path }", handle.reader.dictionary());
    let features = query.unwrap().execute(&handle.reader).unwrap();
    let Feature::Way(path) = &features[0] else { panic!("expected a way") };
    assert_eq!(path.relation_ids, vec![20]);

    let query = Query::parse("bbox(0,0,1,1).relations{ type=route }", handle.reader.dictionary());
    let features = query.unwrap().execute(&handle.reader).unwrap();
    let Feature::Relation(route) = &features[0] else { panic!("expected a relation") };
    assert_eq!(route.way_ids, vec![10]);
    assert_eq!(route.parent_relation_ids, vec![21]);
}

#[test]
fn import_reports_stats() {
    let tempdir = tempfile::tempdir().unwrap();
    let engine = Graticule::new(IndexConfig::new(tempdir.path()));
    let mut source = street_furniture();
    let stats = engine.import(&mut source, &|| false, &NoProgress).unwrap();
    assert_eq!(stats.nodes, 5);
    assert_eq!(stats.ways, 2);
    assert_eq!(stats.relations, 2);
    assert_eq!(stats.skipped_ways, 0);
    assert_eq!(stats.skipped_relations, 0);
    assert_eq!(stats.cells, 3);
}

#[test]
fn unresolvable_members_are_skipped() {
    let handle = build_index(vec![
        node(1, 0.01, 0.01, &[("amenity", "bench")]),
        way(10, &[998, 999], &[("highway", "path")]),
        relation(20, &[996], &[997], &[], &[("type", "route")]),
    ]);
    assert_eq!(run(&handle, "bbox(0,0,1,1).ways{ highway=* }"), Vec::<u64>::new());
    assert_eq!(run(&handle, "bbox(0,0,1,1).relations{ type=* }"), Vec::<u64>::new());
    assert_eq!(run(&handle, "bbox(0,0,1,1).nodes{ amenity=* }"), vec![1]);
}

#[test]
fn canceled_imports_abort() {
    let tempdir = tempfile::tempdir().unwrap();
    let engine = Graticule::new(IndexConfig::new(tempdir.path()));
    let mut source = vec![node(1, 0.0, 0.0, &[])];
    let err = engine.import(&mut source, &|| true, &NoProgress).unwrap_err();
    assert!(matches!(err, graticule::Error::BuildCanceled));
}

#[test]
fn corrupt_records_fail_strict_and_skip_lenient() {
    let elements = vec![
        node(1, 0.01, 0.01, &[("amenity", "bench")]),
        node(2, 0.02, 0.02, &[("amenity", "bench")]),
    ];

    let tempdir = tempfile::tempdir().unwrap();
    let mut config = IndexConfig::new(tempdir.path());
    let engine = Graticule::new(config.clone());
    let mut source = elements;
    engine.import(&mut source, &|| false, &NoProgress).unwrap();

    // tack a half record onto the cell file
    let cell_file = tempdir.path().join("grid-index/node/0/0.cell");
    let mut bytes = std::fs::read(&cell_file).unwrap();
    bytes.extend_from_slice(&[0xde, 0xad, 0xbe]);
    std::fs::write(&cell_file, bytes).unwrap();

    let reader = engine.open().unwrap();
    let query = Query::parse("bbox(0,0,0.1,0.1).nodes{ amenity=bench }", reader.dictionary());
    let features = query.unwrap().execute(&reader).unwrap();
    assert_eq!(features.len(), 2);

    config.check_feature_validity = true;
    let strict = Graticule::new(config).open().unwrap();
    let query = Query::parse("bbox(0,0,0.1,0.1).nodes{ amenity=bench }", strict.dictionary());
    assert!(matches!(
        query.unwrap().execute(&strict),
        Err(graticule::Error::Corrupt { kind: FeatureKind::Node, .. })
    ));
}

#[test]
fn geojson_output_roundtrips_through_serde() {
    let handle = build_index(street_furniture());
    let query = Query::parse("bbox(0,0,1,1).nodes{ amenity=bench }", handle.reader.dictionary());
    let features = query.unwrap().execute(&handle.reader).unwrap();

    let out = handle.engine.config().base_dir.join("output.geojson");
    graticule::write_geojson(&out, &features, handle.reader.dictionary()).unwrap();

    let document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(document["type"], "FeatureCollection");
    assert_eq!(document["features"].as_array().unwrap().len(), 1);
    assert_eq!(document["features"][0]["properties"]["amenity"], "bench");
    assert_eq!(document["features"][0]["geometry"]["type"], "Point");
}

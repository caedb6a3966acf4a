use spaceflights::recipe::Recipe;
use spaceflights::steps::default_registry;
use spaceflights::table::{Table, Value};
use spaceflights::validation::validate_recipe;
use std::path::Path;

#[test]
fn bundled_recipes_are_valid() {
    let registry = default_registry();
    for file in ["recipes/spaceflights.yaml", "recipes/training.yaml"] {
        let recipe = Recipe::load(Path::new(file)).expect("bundled recipe should load");
        let report = validate_recipe(&recipe, &registry);
        assert!(
            report.is_ok(),
            "{file} should pass validation: {:?}",
            report.errors
        );
        assert!(report.warnings.is_empty(), "{file}: {:?}", report.warnings);
    }
}

#[test]
fn bundled_recipe_matches_preset() {
    let recipe = Recipe::load(Path::new("recipes/spaceflights.yaml")).unwrap();
    let preset = spaceflights::presets::preset_recipe("spaceflights").unwrap();
    assert_eq!(recipe, preset);
}

#[test]
fn bundled_tables_parse_with_quoted_cells() {
    for (file, columns, rows) in [
        ("data/companies.csv", 5, 10),
        ("data/shuttles.csv", 13, 40),
        ("data/reviews.csv", 10, 39),
    ] {
        let table = Table::read_csv(Path::new(file)).expect("bundled table should parse");
        assert_eq!(table.num_columns(), columns, "{file}");
        assert_eq!(table.num_rows(), rows, "{file}");
    }

    let shuttles = Table::read_csv(Path::new("data/shuttles.csv")).unwrap();
    let vendor = shuttles.column_index("engine_vendor").unwrap();
    assert!(
        shuttles
            .rows()
            .iter()
            .any(|row| row[vendor] == Value::Text("Banks, Wood and Phillips".into()))
    );
}

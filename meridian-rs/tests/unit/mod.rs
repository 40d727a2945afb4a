// Unit-style tests focused on SQL rendering/validation helpers.
mod query_builder_alias_qualified;
mod query_builder_join_pruning;
mod query_builder_measures;
mod query_builder_unit;

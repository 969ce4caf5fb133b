pub mod test_introspect;

pub(crate) mod node_aware;

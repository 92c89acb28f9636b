//! Seams to collaborators that live outside the storage engine: a
//! where-clause expression evaluator, an extent transport between
//! processes or machines, and a statistics sink.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::error::{ExtentError, Result};
use crate::extent::{Extent, ExtentSeries, GeneralField};
use crate::module::ExtentModule;
use crate::schema::ExtentSchema;

// ── Expressions ─────────────────────────────────────────────────────

/// Compiles expression text against one schema.
pub trait ExpressionEvaluator: Send + Sync {
    fn compile(&self, schema: &Arc<ExtentSchema>, text: &str) -> Result<Box<dyn RowExpression>>;
}

/// A predicate over the series' current row.
pub trait RowExpression: Send {
    fn matches(&self, series: &ExtentSeries) -> bool;
}

// ── Transport ───────────────────────────────────────────────────────

pub type NodeId = u32;

pub trait ExtentTransport: Send {
    fn send(&self, extent: Extent, destination: NodeId) -> Result<()>;

    /// Blocks for the next extent; `None` once the transport is shut down.
    fn receive(&self) -> Option<(Extent, NodeId)>;
}

/// In-process transport: one endpoint per node over crossbeam channels.
pub struct ChannelTransport {
    node: NodeId,
    peers: Vec<Sender<(Extent, NodeId)>>,
    inbox: Receiver<(Extent, NodeId)>,
}

impl ChannelTransport {
    /// Build a fully connected group of `nodes` endpoints; endpoint `i`
    /// is node `i`.
    pub fn mesh(nodes: usize) -> Vec<ChannelTransport> {
        let (senders, inboxes): (Vec<_>, Vec<_>) =
            (0..nodes).map(|_| crossbeam_channel::unbounded()).unzip();
        inboxes
            .into_iter()
            .enumerate()
            .map(|(node, inbox)| ChannelTransport {
                node: node as NodeId,
                peers: senders.clone(),
                inbox,
            })
            .collect()
    }

    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl ExtentTransport for ChannelTransport {
    fn send(&self, extent: Extent, destination: NodeId) -> Result<()> {
        let peer = self.peers.get(destination as usize).ok_or_else(|| {
            ExtentError::Usage(format!("no node {} in a group of {}", destination, self.peers.len()))
        })?;
        peer.send((extent, self.node)).map_err(|_| ExtentError::Aborted)
    }

    fn receive(&self) -> Option<(Extent, NodeId)> {
        self.inbox.recv().ok()
    }
}

// ── Aggregation ─────────────────────────────────────────────────────

pub trait AggregationSink {
    fn add(&mut self, value: f64);
}

impl AggregationSink for Vec<f64> {
    fn add(&mut self, value: f64) {
        self.push(value);
    }
}

/// Drain `module`, feeding every non-null numeric value of `field` into
/// `sink`. Returns the number of values added.
pub fn aggregate_field(
    module: &mut dyn ExtentModule,
    field: &str,
    sink: &mut dyn AggregationSink,
) -> Result<u64> {
    let mut accessor = GeneralField::new(field);
    let mut added = 0;
    while let Some(extent) = module.get_extent()? {
        accessor.bind(extent.schema())?;
        let mut series = ExtentSeries::with_extent(extent);
        while series.more() {
            let value = accessor.get(&series);
            if !value.is_null() {
                let number = value.as_f64().ok_or_else(|| {
                    ExtentError::Schema(format!("field '{}' is not numeric", field))
                })?;
                sink.add(number);
                added += 1;
            }
            series.next_row();
        }
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::DoubleField;
    use crate::module::VecModule;
    use crate::schema::TypeRegistry;

    #[test]
    fn test_channel_mesh_delivers_with_source() {
        let schema = TypeRegistry::new()
            .register(r#"<ExtentType name="M"><field type="byte" name="b"/></ExtentType>"#)
            .unwrap();
        let nodes = ChannelTransport::mesh(3);
        nodes[0].send(Extent::new(Arc::clone(&schema)), 2).unwrap();
        nodes[1].send(Extent::new(schema), 2).unwrap();
        let mut sources = vec![nodes[2].receive().unwrap().1, nodes[2].receive().unwrap().1];
        sources.sort();
        assert_eq!(sources, vec![0, 1]);
        assert!(matches!(
            nodes[0].send(Extent::new(TypeRegistry::new().index_schema().clone()), 7),
            Err(ExtentError::Usage(_))
        ));
    }

    #[test]
    fn test_aggregate_field_skips_nulls() {
        let schema = TypeRegistry::new()
            .register(
                r#"<ExtentType name="Agg"><field type="double" name="d" opt_nullable="yes"/></ExtentType>"#,
            )
            .unwrap();
        let d = DoubleField::bound(&schema, "d").unwrap();
        let mut series = ExtentSeries::for_schema(Arc::clone(&schema));
        for i in 0..5 {
            series.new_row();
            if i == 2 {
                d.set_null(&mut series, true);
            } else {
                d.set(&mut series, i as f64);
            }
        }
        let mut module = VecModule::new(vec![series.take_extent().unwrap()]);
        let mut values: Vec<f64> = Vec::new();
        let added = aggregate_field(&mut module, "d", &mut values).unwrap();
        assert_eq!(added, 4);
        assert_eq!(values, vec![0.0, 1.0, 3.0, 4.0]);
    }
}

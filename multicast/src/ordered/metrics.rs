use crate::types::SubgroupId;
use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
};

/// Label for per-subgroup metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SubgroupLabel {
    pub subgroup: String,
}

impl From<SubgroupId> for SubgroupLabel {
    fn from(subgroup: SubgroupId) -> Self {
        Self {
            subgroup: subgroup.to_string(),
        }
    }
}

/// Metrics for the [super::Engine].
#[derive(Default)]
pub struct Metrics {
    /// Number of messages posted to the bulk transport
    pub sent: Counter,
    /// Number of messages received from the bulk transport
    pub received: Counter,
    /// Number of placeholder slots generated by pause turns
    pub placeholders: Counter,
    /// Number of messages delivered, by subgroup
    pub delivered: Family<SubgroupLabel, Counter>,
    /// Number of delivered messages reported durable by the writer
    pub persisted: Counter,
    /// Number of reservations refused by back-pressure
    pub rejected: Counter,
    /// Number of queued sends awaiting dispatch
    pub pending: Gauge,
    /// Number of locally-stable messages awaiting delivery
    pub backlog: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given
    /// context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        Self {
            sent: context.get_or_register_default::<Counter>(
                "sent",
                "Number of messages posted to the bulk transport",
            ),
            received: context.get_or_register_default::<Counter>(
                "received",
                "Number of messages received from the bulk transport",
            ),
            placeholders: context.get_or_register_default::<Counter>(
                "placeholders",
                "Number of placeholder slots generated by pause turns",
            ),
            delivered: context.get_or_register_default::<Family<SubgroupLabel, Counter>>(
                "delivered",
                "Number of messages delivered, by subgroup",
            ),
            persisted: context.get_or_register_default::<Counter>(
                "persisted",
                "Number of delivered messages reported durable by the writer",
            ),
            rejected: context.get_or_register_default::<Counter>(
                "rejected",
                "Number of reservations refused by back-pressure",
            ),
            pending: context.get_or_register_default::<Gauge>(
                "pending",
                "Number of queued sends awaiting dispatch",
            ),
            backlog: context.get_or_register_default::<Gauge>(
                "backlog",
                "Number of locally-stable messages awaiting delivery",
            ),
        }
    }
}

pub(crate) mod ingress;

pub(crate) use ingress::EventIngress;

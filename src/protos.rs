//! Persisted records and peer messages of the `oracle.v1` package.
//!
//! The structs are declared with prost's derive macros in the same shape `prost-build`
//! generates, so every record is encoded with the protobuf wire format.

pub mod oracle {
    pub mod v1 {
        /// Lifecycle position of a request.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum RequestState {
            RequestStart = 0,
            ObservationResultCommitted = 1,
            ReportGenerated = 2,
            ReportSigned = 3,
            RequestTransmitted = 4,
            RequestEnd = 5,
            RequestCanceled = 6,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Request {
            #[prost(string, tag = "1")]
            pub chain_id: ::prost::alloc::string::String,
            #[prost(string, tag = "2")]
            pub request_id: ::prost::alloc::string::String,
            #[prost(uint64, tag = "3")]
            pub epoch: u64,
            #[prost(uint64, tag = "4")]
            pub round_id: u64,
            #[prost(enumeration = "RequestState", tag = "5")]
            pub state: i32,
            /// Job specification committed on-chain by the requester.
            #[prost(bytes = "vec", tag = "6")]
            pub payload: ::prost::alloc::vec::Vec<u8>,
            #[prost(uint64, tag = "7")]
            pub start_time: u64,
            /// Reference timestamp of the current round.
            #[prost(uint64, tag = "8")]
            pub receive_time: u64,
            #[prost(uint64, tag = "9")]
            pub send_time: u64,
            #[prost(uint64, tag = "10")]
            pub observation_committed_time: u64,
            #[prost(uint64, tag = "11")]
            pub report_generated_time: u64,
            #[prost(uint64, tag = "12")]
            pub report_signed_time: u64,
            #[prost(uint64, tag = "13")]
            pub transmitted_time: u64,
            #[prost(uint64, tag = "14")]
            pub end_time: u64,
            #[prost(bool, tag = "15")]
            pub retrying: bool,
            #[prost(string, tag = "16")]
            pub transaction_id: ::prost::alloc::string::String,
        }

        #[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
        pub struct Observation {
            #[prost(uint32, tag = "1")]
            pub index: u32,
            #[prost(int64, tag = "2")]
            pub value: i64,
        }

        /// Observation values ordered by peer index.
        ///
        /// `values` has one slot per peer; slots of peers that did not contribute hold zero and
        /// are absent from `observers`.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Report {
            #[prost(string, tag = "1")]
            pub chain_id: ::prost::alloc::string::String,
            #[prost(string, tag = "2")]
            pub request_id: ::prost::alloc::string::String,
            #[prost(uint64, tag = "3")]
            pub epoch: u64,
            #[prost(int64, repeated, tag = "4")]
            pub values: ::prost::alloc::vec::Vec<i64>,
            #[prost(uint32, repeated, tag = "5")]
            pub observers: ::prost::alloc::vec::Vec<u32>,
            #[prost(uint64, tag = "6")]
            pub created_time: u64,
        }

        /// A peer's own observation for an epoch, kept so later rounds reuse the same value.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct DataMessage {
            #[prost(string, tag = "1")]
            pub chain_id: ::prost::alloc::string::String,
            #[prost(string, tag = "2")]
            pub request_id: ::prost::alloc::string::String,
            #[prost(uint64, tag = "3")]
            pub epoch: u64,
            #[prost(uint64, tag = "4")]
            pub round_id: u64,
            #[prost(message, optional, tag = "5")]
            pub observation: ::core::option::Option<Observation>,
            #[prost(uint64, tag = "6")]
            pub sent_time: u64,
        }

        #[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
        pub struct PartialSignature {
            #[prost(uint32, tag = "1")]
            pub index: u32,
            #[prost(bytes = "vec", tag = "2")]
            pub signature: ::prost::alloc::vec::Vec<u8>,
        }

        /// Everything the target chain needs to accept a report.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct TransmitPayload {
            #[prost(string, tag = "1")]
            pub chain_id: ::prost::alloc::string::String,
            #[prost(string, tag = "2")]
            pub request_id: ::prost::alloc::string::String,
            #[prost(uint64, tag = "3")]
            pub epoch: u64,
            #[prost(uint64, tag = "4")]
            pub round_id: u64,
            #[prost(message, optional, tag = "5")]
            pub report: ::core::option::Option<Report>,
            #[prost(message, repeated, tag = "6")]
            pub signatures: ::prost::alloc::vec::Vec<PartialSignature>,
            #[prost(bytes = "vec", tag = "7")]
            pub distributed_public_key: ::prost::alloc::vec::Vec<u8>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct RequestJob {
            #[prost(bytes = "vec", tag = "1")]
            pub payload: ::prost::alloc::vec::Vec<u8>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct RequestData {
            #[prost(message, optional, tag = "1")]
            pub observation: ::core::option::Option<Observation>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct RequestReport {
            #[prost(message, optional, tag = "1")]
            pub report: ::core::option::Option<Report>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct RequestReportSignature {
            #[prost(message, optional, tag = "1")]
            pub partial: ::core::option::Option<PartialSignature>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct TransmittedResult {
            #[prost(string, tag = "1")]
            pub transaction_id: ::prost::alloc::string::String,
        }

        /// Envelope exchanged between peers. The routing tuple must be validated by the
        /// receiver before the body is acted upon.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct PeerMessage {
            #[prost(string, tag = "1")]
            pub chain_id: ::prost::alloc::string::String,
            #[prost(string, tag = "2")]
            pub request_id: ::prost::alloc::string::String,
            #[prost(uint64, tag = "3")]
            pub epoch: u64,
            #[prost(uint64, tag = "4")]
            pub round_id: u64,
            #[prost(oneof = "peer_message::Body", tags = "5, 6, 7, 8, 9")]
            pub body: ::core::option::Option<peer_message::Body>,
        }

        pub mod peer_message {
            #[derive(Clone, PartialEq, ::prost::Oneof)]
            pub enum Body {
                #[prost(message, tag = "5")]
                RequestJob(super::RequestJob),
                #[prost(message, tag = "6")]
                RequestData(super::RequestData),
                #[prost(message, tag = "7")]
                RequestReport(super::RequestReport),
                #[prost(message, tag = "8")]
                RequestReportSignature(super::RequestReportSignature),
                #[prost(message, tag = "9")]
                TransmittedResult(super::TransmittedResult),
            }
        }
    }
}

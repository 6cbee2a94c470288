fn main() {
    tonic_build::compile_protos("proto/dns_exchange.proto")
        .expect("failed to compile proto/dns_exchange.proto");
}

mod remote_client;
